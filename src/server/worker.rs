//! The server worker: rule registry, tunnel registry and the threads that
//! drive them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::schema::{BufferConfig, ServerConfig, WorkerConfig};
use crate::endpoint::EndpointAddress;
use crate::error::{Error, Result};
use crate::filter::FilterFactory;
use crate::license::Licenses;
use crate::lifecycle::Shutdown;
use crate::net::acceptor::{AcceptHandler, Acceptor, Incoming, IncomingHandler};
use crate::net::connection::{Connection, ConnectionSettings};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::rule::{Rule, RuleEndpoint, ServiceRule, TunnelRule};
use crate::server::opening_pool::{OpeningPool, OpeningPoolConfig};
use crate::server::registry::{ActiveInput, ActiveRule, ActiveServices, CowMap, GroupedMap, Recheck, RuleInfo};
use crate::server::updater::Updater;
use crate::server::{rules_check, services};
use crate::service::{ActiveService, ServiceFactory};
use crate::tunnel::{
    open_endpoint_connections, ConnectionPair, ListenerFactory, Tunnel, TunnelContext, TunnelHost,
    TunnelId,
};

/// Base delay of the rules check backoff.
const RECHECK_BASE_MS: u64 = 1_000;

/// Proactor threads never go below this.
const MIN_PROACTOR_THREADS: usize = 8;

/// Work serialized on the updating thread.
#[derive(Debug)]
enum UpdateRequest {
    Update(Rule),
    Delete(Uuid),
    /// Retry a rule from the re-check set, if it is still there.
    Recheck(Uuid),
    /// Reopen an active rule after one of its static tunnels closed.
    Reopen(Uuid),
}

/// Everything a server worker is built from.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker: WorkerConfig,
    pub buffer: BufferConfig,
    pub licenses: Licenses,
    pub listeners: ListenerFactory,
    pub filters: FilterFactory,
    pub services: ServiceFactory,
}

impl WorkerOptions {
    /// Built-in listeners and filters, no services.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            buffer: config.buffer.clone(),
            licenses: Licenses::from_config(&config.license),
            listeners: ListenerFactory::with_defaults(),
            filters: FilterFactory::with_defaults(),
            services: ServiceFactory::new(),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

pub(crate) struct WorkerCore {
    me: Weak<WorkerCore>,
    handle: Handle,
    config: WorkerConfig,
    settings: ConnectionSettings,
    licenses: Licenses,
    listeners: Arc<ListenerFactory>,
    filters: FilterFactory,
    service_factory: ServiceFactory,
    rules: CowMap<Uuid, ActiveRule>,
    tunnels: GroupedMap<TunnelId, Uuid, Arc<Tunnel>>,
    services: CowMap<Uuid, ActiveServices>,
    recheck: CowMap<Uuid, Recheck>,
    opening: OpeningPool,
    updater: OnceLock<Updater<UpdateRequest, Result<bool>>>,
    stopping: AtomicBool,
}

/// Accept-loop target of one accepting input.
struct InputTarget {
    core: Weak<WorkerCore>,
    rule: Weak<RuleInfo>,
    endpoint: Arc<RuleEndpoint>,
}

impl IncomingHandler for InputTarget {
    fn on_incoming(&self, acceptor: &Arc<dyn Acceptor>, incoming: Incoming) {
        let (Some(core), Some(info)) = (self.core.upgrade(), self.rule.upgrade()) else {
            return;
        };
        core.open_tunnel(&info, &self.endpoint, acceptor, incoming);
    }
}

impl WorkerCore {
    fn tunnel_context(&self) -> TunnelContext {
        let host: Weak<dyn TunnelHost> = self.me.clone();
        TunnelContext {
            handle: self.handle.clone(),
            host,
            listeners: Arc::clone(&self.listeners),
            settings: self.settings,
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn call(&self, request: UpdateRequest) -> Result<bool> {
        self.updater
            .get()
            .ok_or_else(|| Error::Logical("updating thread is not running".into()))?
            .call(request)?
    }

    fn apply(&self, request: UpdateRequest) -> Result<bool> {
        match request {
            UpdateRequest::Update(Rule::Tunnel(rule)) => self.update_tunnel_rule(rule),
            UpdateRequest::Update(Rule::Service(rule)) => self.update_service_rule(rule),
            UpdateRequest::Delete(uuid) => Ok(self.delete_rule(uuid)),
            UpdateRequest::Recheck(uuid) => self.recheck_rule(uuid),
            UpdateRequest::Reopen(uuid) => self.reopen_rule(uuid),
        }
    }

    fn tunnel_rule(&self, uuid: Uuid) -> Option<Arc<RuleInfo>> {
        match self.rules.get(&uuid) {
            Some(ActiveRule::Tunnel(info)) => Some(info),
            _ => None,
        }
    }

    // ---- rule updating (updating thread only) ----

    fn update_tunnel_rule(&self, rule: Arc<TunnelRule>) -> Result<bool> {
        let uuid = rule.uuid;
        tracing::debug!(rule = %uuid, "Updating tunnel rule");
        let failures = self.recheck.remove(&uuid).map(|r| r.failures).unwrap_or(0);

        let is_new = match self.rules.remove(&uuid) {
            Some(old) => {
                self.deactivate(old);
                false
            }
            None => true,
        };
        for tunnel in self.tunnels.remove_group(&uuid) {
            self.teardown(&tunnel);
        }
        metrics::set_active_tunnels(self.tunnels.len());

        if !rule.enabled {
            tracing::info!(rule = %rule.name, uuid = %uuid, "Tunnel rule is disabled");
            return Ok(true);
        }
        if !self.licenses.rules.is_feature_available(self.rules.len() + 1) {
            tracing::warn!(rule = %rule.name, "Failed to activate rule: too many rules activated");
            return Err(Error::LicenseExceeded("too many rules activated".into()));
        }

        let info = RuleInfo::new(Arc::clone(&rule));
        let mut opened = 0;
        let mut new_tunnels: Vec<Arc<Tunnel>> = Vec::new();
        let mut check = false;
        for endpoint in &rule.inputs {
            if endpoint.is_acceptor {
                let address = Arc::clone(endpoint.addresses.read());
                if !address.is_has_multi_clients_type() {
                    tracing::error!(
                        rule = %rule.name,
                        endpoint = %address.resource_identifier(),
                        "Failed to open endpoint for tunnel entrance: endpoint of such type can not accept connections"
                    );
                    break;
                }
                match self.open_input(&info, endpoint, address) {
                    Ok(()) => opened += 1,
                    Err(err) => {
                        tracing::error!(
                            rule = %rule.name,
                            endpoint = %endpoint.addresses,
                            error = %err,
                            "Failed to open endpoint for incoming connections"
                        );
                        check = true;
                    }
                }
            } else {
                let requested = self.tunnels.len() + new_tunnels.len() + 1;
                if !self.licenses.tunnels.is_feature_available(requested) {
                    tracing::warn!(rule = %rule.name, "Failed to open new connection: too many tunnels");
                    self.handle.block_on(info.deactivate());
                    for tunnel in &new_tunnels {
                        self.teardown(tunnel);
                    }
                    return Err(Error::LicenseExceeded("too many tunnels opened".into()));
                }
                match self.handle.block_on(self.open_static_tunnel(&rule, endpoint)) {
                    Ok(tunnel) => {
                        new_tunnels.push(tunnel);
                        opened += 1;
                    }
                    Err(err) => {
                        self.report_opening_error(&rule, &err);
                        check = true;
                    }
                }
            }
        }

        self.start_filters(&info);
        self.rules.insert(uuid, ActiveRule::Tunnel(info));
        for tunnel in new_tunnels {
            metrics::tunnel_opened();
            self.register_tunnel(tunnel);
        }
        if check {
            self.queue_recheck(Arc::clone(&rule), failures + 1);
        }
        tracing::info!(
            rule = %rule.name,
            uuid = %uuid,
            opened,
            inputs = rule.inputs.len(),
            "{}",
            if is_new { "Tunnel rule inserted" } else { "Tunnel rule updated" }
        );
        Ok(opened == rule.inputs.len())
    }

    fn update_service_rule(&self, rule: Arc<ServiceRule>) -> Result<bool> {
        let uuid = rule.uuid;
        tracing::debug!(rule = %uuid, "Updating service rule");
        if rule.services.is_empty() {
            tracing::debug!(rule = %uuid, "Service rule is empty");
            return Ok(false);
        }
        if let Some(old) = self.rules.remove(&uuid) {
            self.deactivate(old);
        }
        if !rule.enabled {
            return Ok(true);
        }
        if !self.licenses.rules.is_feature_available(self.rules.len() + 1) {
            tracing::warn!(rule = %rule.name, "Failed to activate rule: too many rules activated");
            return Err(Error::LicenseExceeded("too many rules activated".into()));
        }

        let mut started: ActiveServices = Vec::with_capacity(rule.services.len());
        for info in &rule.services {
            let result = self
                .service_factory
                .create(&rule, info)
                .map(|service| Arc::new(ActiveService::new(Arc::clone(&rule), info.clone(), service)))
                .and_then(|active| active.start().map(|()| active));
            match result {
                Ok(active) => started.push(active),
                Err(err) => {
                    for active in &started {
                        active.stop();
                    }
                    return Err(err);
                }
            }
        }
        self.services.insert(uuid, started);
        self.rules.insert(uuid, ActiveRule::Service(Arc::clone(&rule)));
        tracing::info!(rule = %rule.name, uuid = %uuid, services = rule.services.len(), "Service rule activated");
        Ok(true)
    }

    fn delete_rule(&self, uuid: Uuid) -> bool {
        tracing::debug!(rule = %uuid, "Deleting rule");
        let mut deleted = false;
        match self.rules.remove(&uuid) {
            Some(rule) => {
                self.deactivate(rule);
                deleted = true;
                tracing::info!(rule = %uuid, "Rule removed from active list");
            }
            None => tracing::debug!(rule = %uuid, "Failed to find rule in active list"),
        }
        if self.recheck.remove(&uuid).is_some() {
            tracing::debug!(rule = %uuid, "Rule removed from checking list");
            deleted = true;
        }
        deleted
    }

    fn recheck_rule(&self, uuid: Uuid) -> Result<bool> {
        let Some(entry) = self.recheck.get(&uuid) else {
            return Ok(true);
        };
        tracing::debug!(rule = %entry.rule.name, attempt = entry.failures + 1, "Checking rule");
        match self.update_tunnel_rule(Arc::clone(&entry.rule)) {
            Ok(opened) => Ok(opened),
            Err(err) => {
                if err.is_license() {
                    tracing::debug!(rule = %entry.rule.name, error = %err, "Rule check hit the license limit");
                } else {
                    tracing::error!(rule = %entry.rule.name, error = %err, "Rule check failed");
                }
                self.queue_recheck(entry.rule, entry.failures + 1);
                Ok(false)
            }
        }
    }

    fn reopen_rule(&self, uuid: Uuid) -> Result<bool> {
        let Some(info) = self.tunnel_rule(uuid) else {
            tracing::debug!(rule = %uuid, "Rule is not active any more, static tunnel is not reopened");
            return Ok(false);
        };
        let rule = info.rule();
        tracing::debug!(rule = %rule.name, "Trying to reopen rule for static tunnel");
        match self.update_tunnel_rule(Arc::clone(&rule)) {
            Err(err) if err.is_license() => {
                tracing::warn!(rule = %rule.name, error = %err, "Static tunnel is not reopened, rule queued for check");
                self.queue_recheck(rule, 1);
                Ok(false)
            }
            other => other,
        }
    }

    fn queue_recheck(&self, rule: Arc<TunnelRule>, failures: u32) {
        let cap_ms = self.config.rules_check_interval_secs.saturating_mul(1_000).max(RECHECK_BASE_MS);
        let delay = calculate_backoff(failures, RECHECK_BASE_MS, cap_ms);
        tracing::debug!(rule = %rule.name, failures, delay_ms = delay.as_millis() as u64, "Rule queued for check");
        self.recheck.insert(
            rule.uuid,
            Recheck {
                rule,
                failures,
                not_before: Instant::now() + delay,
            },
        );
    }

    /// Rules whose backoff has elapsed.
    pub(crate) fn due_rechecks(&self, now: Instant) -> Vec<Uuid> {
        self.recheck
            .snapshot()
            .values()
            .filter(|entry| entry.not_before <= now)
            .map(|entry| entry.rule.uuid)
            .collect()
    }

    pub(crate) fn run_recheck(&self, uuid: Uuid) {
        match self.call(UpdateRequest::Recheck(uuid)) {
            Ok(true) => tracing::debug!(rule = %uuid, "Rule check completed"),
            Ok(false) => {}
            Err(err) => tracing::debug!(rule = %uuid, error = %err, "Rule check skipped"),
        }
    }

    fn deactivate(&self, rule: ActiveRule) {
        match rule {
            ActiveRule::Tunnel(info) => self.handle.block_on(info.deactivate()),
            ActiveRule::Service(rule) => {
                if let Some(services) = self.services.remove(&rule.uuid) {
                    for service in services {
                        service.stop();
                    }
                }
            }
        }
    }

    fn open_input(
        &self,
        info: &Arc<RuleInfo>,
        endpoint: &Arc<RuleEndpoint>,
        address: Arc<dyn EndpointAddress>,
    ) -> Result<()> {
        let settings = endpoint.connection_settings(&self.settings);
        let acceptor = self
            .handle
            .block_on(address.open_for_incoming_connections(Arc::clone(endpoint), settings))?;
        let target: Arc<dyn IncomingHandler> = Arc::new(InputTarget {
            core: self.me.clone(),
            rule: Arc::downgrade(info),
            endpoint: Arc::clone(endpoint),
        });
        let handler = AcceptHandler::start(&self.handle, acceptor, Arc::downgrade(&target));
        info.add_input(ActiveInput {
            endpoint: endpoint.uuid,
            handler,
            target,
        });
        Ok(())
    }

    async fn open_static_tunnel(
        &self,
        rule: &Arc<TunnelRule>,
        endpoint: &Arc<RuleEndpoint>,
    ) -> Result<Arc<Tunnel>> {
        let source = open_endpoint_connections(endpoint, &self.settings, false)
            .await
            .map_err(|err| Error::source_opening("-", endpoint.addresses.to_string(), err.to_string()))?;
        Tunnel::create(self.tunnel_context(), Arc::clone(rule), Arc::clone(endpoint), source, true).await
    }

    fn start_filters(&self, info: &Arc<RuleInfo>) {
        for name in &info.rule().filters {
            let filter = match self.filters.create(name) {
                Ok(filter) => filter,
                Err(err) => {
                    tracing::error!(rule = %info.uuid, error = %err, "Failed to create rule filter");
                    continue;
                }
            };
            let rule = Arc::downgrade(info);
            let mut stop = info.stop_signal();
            self.handle.spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(filter.interval()) => {}
                        _ = stop.wait_for(|stopped| *stopped) => break,
                    }
                    let Some(info) = rule.upgrade() else { break };
                    if let Some(changed) = filter.change_rule(info.rule()).await {
                        tracing::debug!(rule = %info.uuid, filter = filter.name(), "Rule changed by filter");
                        info.replace_rule(changed);
                    }
                }
            });
        }
    }

    // ---- tunnels ----

    /// Inbound attempt on an accepting input. Runs on the proactor, so the
    /// slow parts are queued on the opening pool.
    fn open_tunnel(
        &self,
        info: &Arc<RuleInfo>,
        endpoint: &Arc<RuleEndpoint>,
        acceptor: &Arc<dyn Acceptor>,
        incoming: Incoming,
    ) {
        if self.is_stopping() {
            return;
        }
        let Some(incoming) = acceptor.try_to_attach(incoming) else {
            return;
        };
        tracing::debug!(peer = %incoming.peer(), rule = %info.uuid, "Incoming connection detected, initializing tunnel");
        let settings = endpoint.connection_settings(&self.settings);
        let connection = match acceptor.accept(incoming, settings) {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(rule = %info.uuid, error = %err, "Failed to accept connection");
                return;
            }
        };
        let Some(core) = self.me.upgrade() else {
            connection.close();
            return;
        };
        let limit_reached = info.count_accepted();

        let job_core = Arc::clone(&core);
        let job_info = Arc::clone(info);
        let job_endpoint = Arc::clone(endpoint);
        let job_connection = Arc::clone(&connection);
        let submitted = self.opening.submit(format!("open tunnel for rule {}", info.uuid), move || {
            job_core.open_accepted_tunnel(&job_info, &job_endpoint, job_connection)
        });
        if let Err(err) = submitted {
            tracing::debug!(error = %err, "Tunnel opening is not possible");
            connection.close();
            return;
        }

        if limit_reached {
            let uuid = info.uuid;
            tracing::debug!(rule = %uuid, "Rule will be deleted as max connection number has been reached");
            let submitted = self.opening.submit(format!("delete rule {uuid}"), move || {
                if let Err(err) = core.call(UpdateRequest::Delete(uuid)) {
                    tracing::warn!(rule = %uuid, error = %err, "Failed to delete rule");
                }
            });
            if let Err(err) = submitted {
                tracing::debug!(rule = %uuid, error = %err, "Rule deletion is not possible");
            }
        }
    }

    fn open_accepted_tunnel(
        &self,
        info: &Arc<RuleInfo>,
        endpoint: &Arc<RuleEndpoint>,
        connection: Arc<Connection>,
    ) {
        if !self.licenses.tunnels.is_feature_available(self.tunnels.len() + 1) {
            tracing::warn!(rule = %info.uuid, "Failed to open new connection: too many tunnels");
            connection.close();
            return;
        }
        let rule = info.rule();
        let result = self.handle.block_on(async {
            let source = self.accepted_source(endpoint, connection).await?;
            Tunnel::create(self.tunnel_context(), Arc::clone(&rule), Arc::clone(endpoint), source, false).await
        });
        match result {
            Ok(tunnel) => {
                metrics::tunnel_opened();
                self.register_tunnel(tunnel);
            }
            Err(err) => self.report_opening_error(&rule, &err),
        }
    }

    /// The accepted connection reads; a split endpoint gets its write side
    /// opened locally.
    async fn accepted_source(
        &self,
        endpoint: &Arc<RuleEndpoint>,
        connection: Arc<Connection>,
    ) -> Result<ConnectionPair> {
        if endpoint.addresses.is_combined() {
            return Ok(ConnectionPair::combined(connection));
        }
        let settings = endpoint.connection_settings(&self.settings);
        let write_address = Arc::clone(endpoint.addresses.write());
        let resource = write_address.resource_identifier();
        match write_address.create_local_connection(Arc::clone(endpoint), settings).await {
            Ok(write) => Ok(ConnectionPair {
                read: connection,
                write,
            }),
            Err(err) => {
                connection.close();
                Err(Error::source_opening("-", resource, err.to_string()))
            }
        }
    }

    fn report_opening_error(&self, rule: &TunnelRule, err: &Error) {
        if err.is_destination_opening() {
            rule.errors_treatment.report(&rule.name, &err.to_string());
        } else {
            tracing::error!(rule = %rule.name, error = %err, "Failed to open tunnel");
        }
    }

    /// Make a tunnel visible. A tunnel that asked to close before it was
    /// registered is closed now.
    fn register_tunnel(&self, tunnel: Arc<Tunnel>) {
        let id = tunnel.id();
        self.tunnels.insert(id, tunnel.rule().uuid, Arc::clone(&tunnel));
        metrics::set_active_tunnels(self.tunnels.len());
        if !tunnel.is_alive() {
            self.close_tunnel(id);
        }
    }

    fn teardown(&self, tunnel: &Arc<Tunnel>) {
        self.handle.block_on(tunnel.close());
        metrics::tunnel_closed();
    }

    /// Opening-pool side of [`TunnelHost::close_tunnel`].
    fn finish_tunnel(&self, tunnel: Arc<Tunnel>) {
        let rule = self.tunnel_rule(tunnel.rule().uuid);
        if tunnel.is_setup_failed() && rule.is_some() {
            if self.handle.block_on(tunnel.switch(None)) {
                self.register_tunnel(tunnel);
                return;
            }
            tracing::debug!(tunnel_id = %tunnel.id(), "No destination left for tunnel");
            self.teardown(&tunnel);
            return;
        }
        self.teardown(&tunnel);
        if tunnel.is_static() && rule.is_some() {
            let uuid = tunnel.rule().uuid;
            if let Err(err) = self.call(UpdateRequest::Reopen(uuid)) {
                tracing::error!(rule = %tunnel.rule().name, error = %err, "Failed to reopen rule for static tunnel");
            }
        }
    }

    fn opened_endpoints_number(&self) -> usize {
        self.rules
            .snapshot()
            .values()
            .map(|rule| match rule {
                ActiveRule::Tunnel(info) => info.inputs_number(),
                ActiveRule::Service(_) => 0,
            })
            .sum()
    }

    pub(crate) fn active_services(&self) -> Vec<Arc<ActiveService>> {
        self.services.snapshot().values().flatten().cloned().collect()
    }

    pub(crate) fn dump_stats(&self) {
        let tunnels = self.tunnels.values();
        for tunnel in &tunnels {
            tunnel.dump_latency_stats();
        }
        tracing::debug!(
            tunnels = tunnels.len(),
            endpoints = self.opened_endpoints_number(),
            rules_to_check = self.recheck.len(),
            "Worker statistics"
        );
    }
}

impl TunnelHost for WorkerCore {
    fn close_tunnel(&self, id: TunnelId) {
        if self.is_stopping() {
            return;
        }
        let Some(tunnel) = self.tunnels.remove(&id) else {
            return;
        };
        metrics::set_active_tunnels(self.tunnels.len());
        let Some(core) = self.me.upgrade() else {
            return;
        };
        let fallback = Arc::clone(&tunnel);
        let submitted = self
            .opening
            .submit(format!("close tunnel {id}"), move || core.finish_tunnel(tunnel));
        if let Err(err) = submitted {
            tracing::debug!(tunnel_id = %id, error = %err, "Closing tunnel on the proactor");
            self.handle.spawn(async move { fallback.close().await });
        }
    }
}

/// Rule-driven relay server.
///
/// Owns the proactor runtime, the tunnel-opening pool, the updating thread
/// and the background loops. Methods block and must not be called from
/// inside an async context.
pub struct ServerWorker {
    core: Arc<WorkerCore>,
    runtime: Option<Runtime>,
    shutdown: Shutdown,
    background: Vec<JoinHandle<()>>,
}

impl ServerWorker {
    pub fn start(options: WorkerOptions) -> Result<Self> {
        let WorkerOptions {
            worker,
            buffer,
            licenses,
            listeners,
            filters,
            services: service_factory,
        } = options;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker.proactor_threads.max(MIN_PROACTOR_THREADS))
            .thread_name("tunnelex-proactor")
            .enable_all()
            .build()
            .map_err(|err| Error::system("building proactor runtime", err))?;
        let opening = OpeningPool::new(OpeningPoolConfig {
            min_threads: worker.opening_threads_min,
            max_threads: worker.opening_threads_max,
            idle_timeout: Duration::from_secs(worker.opening_thread_idle_secs.max(1)),
        })?;
        let settings = ConnectionSettings {
            block_size: buffer.block_size,
            connection_buffer_size: buffer.connection_buffer_size,
            close_timeout: Duration::from_secs(worker.close_timeout_secs),
            ..ConnectionSettings::default()
        };

        let core = Arc::new_cyclic(|me| WorkerCore {
            me: me.clone(),
            handle: runtime.handle().clone(),
            config: worker.clone(),
            settings,
            licenses,
            listeners: Arc::new(listeners),
            filters,
            service_factory,
            rules: CowMap::new(),
            tunnels: GroupedMap::new(),
            services: CowMap::new(),
            recheck: CowMap::new(),
            opening,
            updater: OnceLock::new(),
            stopping: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&core);
        let updater = Updater::start("tunnelex-updater", move |request: UpdateRequest| match weak.upgrade() {
            Some(core) => core.apply(request),
            None => Err(Error::Logical("server worker is gone".into())),
        })?;
        let _ = core.updater.set(updater);

        let shutdown = Shutdown::new();
        let mut background = vec![
            runtime.spawn(rules_check::run(
                Arc::downgrade(&core),
                Duration::from_secs(worker.rules_check_interval_secs.max(1)),
                shutdown.subscribe(),
            )),
            runtime.spawn(services::run(
                Arc::downgrade(&core),
                Duration::from_secs(worker.services_interval_secs.max(1)),
                shutdown.subscribe(),
            )),
        ];
        if worker.stats_dump_interval_secs > 0 {
            background.push(runtime.spawn(services::dump_stats(
                Arc::downgrade(&core),
                Duration::from_secs(worker.stats_dump_interval_secs),
                shutdown.subscribe(),
            )));
        }

        tracing::info!(
            proactor_threads = worker.proactor_threads.max(MIN_PROACTOR_THREADS),
            opening_threads_min = worker.opening_threads_min,
            opening_threads_max = worker.opening_threads_max,
            "Server worker started"
        );
        Ok(Self {
            core,
            runtime: Some(runtime),
            shutdown,
            background,
        })
    }

    /// Proactor handle, for callers that need to run async work.
    pub fn handle(&self) -> &Handle {
        &self.core.handle
    }

    /// Insert or replace a rule. True when every input of a tunnel rule
    /// opened; license refusals come back as [`Error::LicenseExceeded`].
    pub fn update(&self, rule: impl Into<Rule>) -> Result<bool> {
        self.core.call(UpdateRequest::Update(rule.into()))
    }

    /// Remove a rule. Its tunnels keep relaying until they close, but are
    /// never switched or reopened.
    pub fn delete_rule(&self, uuid: Uuid) -> Result<bool> {
        self.core.call(UpdateRequest::Delete(uuid))
    }

    pub fn tunnels_number(&self) -> usize {
        self.core.tunnels.len()
    }

    /// Open tunnels of one rule.
    pub fn rule_tunnels_number(&self, rule: Uuid) -> usize {
        self.core.tunnels.group_len(&rule)
    }

    /// Accepting inputs currently listening, over all rules.
    pub fn opened_endpoints_number(&self) -> usize {
        self.core.opened_endpoints_number()
    }

    /// Address an accepting input is actually bound to.
    pub fn real_opened_endpoint_address(&self, rule: Uuid, endpoint: Uuid) -> Result<String> {
        let info = self
            .core
            .tunnel_rule(rule)
            .ok_or_else(|| Error::Logical(format!("failed to find rule {rule} in active list")))?;
        info.acceptor(endpoint)
            .map(|acceptor| acceptor.local_address())
            .ok_or_else(|| Error::Logical(format!("rule {rule} has no opened endpoint {endpoint}")))
    }

    pub fn is_rule_active(&self, uuid: Uuid) -> bool {
        self.core.rules.contains(&uuid)
    }

    pub fn active_rules(&self) -> Vec<Uuid> {
        self.core.rules.snapshot().keys().copied().collect()
    }

    pub fn is_rule_queued_for_check(&self, uuid: Uuid) -> bool {
        self.core.recheck.contains(&uuid)
    }

    /// Ordered stop: background loops, updating thread, accept loops,
    /// tunnels, services, opening pool, proactor.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        tracing::info!("Stopping server worker");
        self.shutdown.trigger();
        for task in self.background.drain(..) {
            let _ = runtime.block_on(task);
        }

        let core = &self.core;
        core.stopping.store(true, Ordering::Release);
        if let Some(updater) = core.updater.get() {
            updater.stop();
        }
        for rule in core.rules.take_all().values() {
            core.deactivate(rule.clone());
        }
        for tunnel in core.tunnels.take_all() {
            core.teardown(&tunnel);
        }
        metrics::set_active_tunnels(0);
        for service in core.services.take_all().values().flatten() {
            service.stop();
        }
        core.recheck.take_all();
        core.opening.stop();
        runtime.shutdown_timeout(core.settings.close_timeout);
        tracing::info!("Server worker stopped");
    }
}

impl Drop for ServerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorker")
            .field("rules", &self.core.rules.len())
            .field("tunnels", &self.core.tunnels.len())
            .field("opening", &self.core.opening)
            .finish()
    }
}
