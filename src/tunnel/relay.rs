//! Pairing, listener wiring and destination failover of a single tunnel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::buffer::MessageBlock;
use crate::endpoint::EndpointAddress;
use crate::error::{Error, Result};
use crate::net::connection::{Connection, ConnectionId, ConnectionSettings, Mode, SetupState};
use crate::net::signal::ConnectionSignal;
use crate::rule::{RuleEndpoint, TunnelRule};
use crate::tunnel::listener::{DataTransferCommand, ListenerChain, ListenerContext, ListenerFactory};
use crate::tunnel::TunnelId;

/// Owner of tunnels, asked to close them.
pub trait TunnelHost: Send + Sync {
    fn close_tunnel(&self, tunnel: TunnelId);
}

/// Shared services a tunnel is created with.
#[derive(Clone)]
pub struct TunnelContext {
    pub handle: Handle,
    pub host: Weak<dyn TunnelHost>,
    pub listeners: Arc<ListenerFactory>,
    pub settings: ConnectionSettings,
}

/// Read and write connections of one side. Pointer-equal when combined.
#[derive(Clone)]
pub struct ConnectionPair {
    pub read: Arc<Connection>,
    pub write: Arc<Connection>,
}

impl ConnectionPair {
    pub fn combined(connection: Arc<Connection>) -> Self {
        Self {
            read: Arc::clone(&connection),
            write: connection,
        }
    }

    pub fn is_combined(&self) -> bool {
        Arc::ptr_eq(&self.read, &self.write)
    }

    fn unique(&self) -> Vec<Arc<Connection>> {
        if self.is_combined() {
            vec![Arc::clone(&self.read)]
        } else {
            vec![Arc::clone(&self.read), Arc::clone(&self.write)]
        }
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.read.id() == id || self.write.id() == id
    }

    fn close(&self) {
        for connection in self.unique() {
            connection.set_signal(None);
            connection.close();
        }
    }

    fn open(&self, handle: &Handle, signal: &Weak<dyn ConnectionSignal>) -> Result<()> {
        if self.is_combined() {
            self.read.open(handle, signal.clone(), Mode::ReadWrite)
        } else {
            self.read.open(handle, signal.clone(), Mode::Read)?;
            self.write.open(handle, signal.clone(), Mode::Write)
        }
    }
}

/// Open the connections of a rule endpoint: remote (destination) or local
/// (static input).
pub async fn open_endpoint_connections(
    endpoint: &Arc<RuleEndpoint>,
    base: &ConnectionSettings,
    remote: bool,
) -> Result<ConnectionPair> {
    let settings = endpoint.connection_settings(base);
    let open = |address: &Arc<dyn EndpointAddress>| {
        let address = Arc::clone(address);
        if remote {
            address.create_remote_connection(Arc::clone(endpoint), settings)
        } else {
            address.create_local_connection(Arc::clone(endpoint), settings)
        }
    };
    if endpoint.addresses.is_combined() {
        return Ok(ConnectionPair::combined(open(endpoint.addresses.read()).await?));
    }
    let read = open(endpoint.addresses.read()).await?;
    match open(endpoint.addresses.write()).await {
        Ok(write) => Ok(ConnectionPair { read, write }),
        Err(err) => {
            read.close();
            Err(err)
        }
    }
}

struct Destination {
    index: usize,
    endpoint: Arc<RuleEndpoint>,
    pair: ConnectionPair,
}

/// Try destinations in order starting at `from`. Every failure but the last
/// one is reported with the rule's severity and skipped.
async fn create_destination_connections(
    rule: &TunnelRule,
    tunnel: TunnelId,
    from: usize,
    settings: &ConnectionSettings,
) -> Result<Destination> {
    if rule.destinations.is_empty() {
        return Err(Error::destination_opening(tunnel, "-", "rule has no destinations"));
    }
    let mut last_error = None;
    for (index, endpoint) in rule.destinations.iter().enumerate().skip(from) {
        match open_endpoint_connections(endpoint, settings, true).await {
            Ok(pair) => {
                return Ok(Destination {
                    index,
                    endpoint: Arc::clone(endpoint),
                    pair,
                })
            }
            Err(err) => {
                let error =
                    Error::destination_opening(tunnel, endpoint.addresses.to_string(), err.to_string());
                if index + 1 < rule.destinations.len() {
                    rule.errors_treatment.report(&rule.name, &error.to_string());
                }
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        Error::destination_opening(tunnel, "-", "no destination left to try")
    }))
}

struct State {
    source: ConnectionPair,
    destination: Option<Destination>,
    /// The current destination has already been recreated in place once.
    recreated_in_place: bool,
    setup_pending: HashSet<ConnectionId>,
    setup_failed: bool,
    /// A source connection asked to close.
    source_lost: bool,
    to_destination: Arc<ListenerChain>,
    to_source: Arc<ListenerChain>,
    /// Every connection this tunnel ever owned, for teardown.
    tracked: Vec<Arc<Connection>>,
}

impl State {
    fn track(&mut self, pair: &ConnectionPair) {
        for connection in pair.unique() {
            if !self.tracked.iter().any(|c| c.id() == connection.id()) {
                self.tracked.push(connection);
            }
        }
    }

    fn current(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.source.unique();
        if let Some(destination) = &self.destination {
            connections.extend(destination.pair.unique());
        }
        connections
    }
}

/// One relayed session.
pub struct Tunnel {
    id: TunnelId,
    rule: Arc<TunnelRule>,
    source_endpoint: Arc<RuleEndpoint>,
    is_static: bool,
    context: TunnelContext,
    me: Weak<Tunnel>,
    state: Mutex<State>,
    alive: AtomicBool,
    closing: AtomicBool,
}

impl Tunnel {
    /// Pair `source` with the first destination that opens, wire listeners
    /// and start setup. On failure every connection, the source included,
    /// is closed.
    pub async fn create(
        context: TunnelContext,
        rule: Arc<TunnelRule>,
        source_endpoint: Arc<RuleEndpoint>,
        source: ConnectionPair,
        is_static: bool,
    ) -> Result<Arc<Tunnel>> {
        let id = TunnelId::new();
        let destination =
            match create_destination_connections(&rule, id, 0, &context.settings).await {
                Ok(destination) => destination,
                Err(err) => {
                    source.close();
                    return Err(err);
                }
            };

        let mut state = State {
            source,
            destination: None,
            recreated_in_place: false,
            setup_pending: HashSet::new(),
            setup_failed: false,
            source_lost: false,
            to_destination: Arc::default(),
            to_source: Arc::default(),
            tracked: Vec::new(),
        };
        let source_pair = state.source.clone();
        state.track(&source_pair);
        state.track(&destination.pair);
        state.destination = Some(destination);

        let tunnel = Arc::new_cyclic(|me| Tunnel {
            id,
            rule,
            source_endpoint,
            is_static,
            context,
            me: me.clone(),
            state: Mutex::new(state),
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });
        if let Err(err) = tunnel.init() {
            tunnel.close().await;
            return Err(err);
        }
        tracing::info!(
            rule = %tunnel.rule.name,
            tunnel_id = %tunnel.id,
            source = %tunnel.source_identifier(),
            destination = %tunnel.destination_identifier(),
            "Created tunnel"
        );
        tunnel.start_setup();
        Ok(tunnel)
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn rule(&self) -> &Arc<TunnelRule> {
        &self.rule
    }

    pub fn source_endpoint(&self) -> &Arc<RuleEndpoint> {
        &self.source_endpoint
    }

    /// Opened for a non-accepting input.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// A destination connection failed its setup.
    pub fn is_setup_failed(&self) -> bool {
        self.state.lock().setup_failed
    }

    /// Index of the current destination in the rule's list.
    pub fn destination_index(&self) -> Option<usize> {
        self.state.lock().destination.as_ref().map(|d| d.index)
    }

    pub fn source_identifier(&self) -> String {
        self.state.lock().source.read.identifier().to_string()
    }

    pub fn destination_identifier(&self) -> String {
        self.state
            .lock()
            .destination
            .as_ref()
            .map(|d| d.pair.read.identifier().to_string())
            .unwrap_or_default()
    }

    /// Current connections, each once.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().current()
    }

    pub fn dump_latency_stats(&self) {
        for connection in self.connections() {
            connection.dump_latency_stats();
        }
    }

    fn signal(&self) -> Weak<dyn ConnectionSignal> {
        let me: Weak<dyn ConnectionSignal> = self.me.clone();
        me
    }

    /// Open connections and build the listener chains for the current pairs.
    fn init(&self) -> Result<()> {
        let (source, destination_pair, destination_endpoint) = {
            let state = self.state.lock();
            let destination = state
                .destination
                .as_ref()
                .ok_or_else(|| Error::Logical(format!("tunnel {} has no destination", self.id)))?;
            (
                state.source.clone(),
                destination.pair.clone(),
                Arc::clone(&destination.endpoint),
            )
        };
        let signal = self.signal();
        source.open(&self.context.handle, &signal)?;
        destination_pair.open(&self.context.handle, &signal)?;

        let listeners = &self.context.listeners;
        let to_destination = listeners.chain(
            self.source_endpoint
                .post_listeners
                .iter()
                .chain(destination_endpoint.pre_listeners.iter()),
            &ListenerContext {
                rule: self.rule.uuid,
                endpoint: self.source_endpoint.uuid,
                tunnel: self.id,
                connection: source.read.id(),
            },
        )?;
        let to_source = listeners.chain(
            destination_endpoint
                .post_listeners
                .iter()
                .chain(self.source_endpoint.pre_listeners.iter()),
            &ListenerContext {
                rule: self.rule.uuid,
                endpoint: destination_endpoint.uuid,
                tunnel: self.id,
                connection: destination_pair.read.id(),
            },
        )?;

        let mut state = self.state.lock();
        state.to_destination = Arc::new(to_destination);
        state.to_source = Arc::new(to_source);
        Ok(())
    }

    /// Start setup on every connection that is not set up yet; reading
    /// starts once all of them completed.
    pub fn start_setup(&self) {
        let pending = {
            let mut state = self.state.lock();
            let pending: Vec<_> = state
                .current()
                .into_iter()
                .filter(|c| !c.is_setup_completed())
                .collect();
            state.setup_pending = pending.iter().map(|c| c.id()).collect();
            pending
        };
        if pending.is_empty() {
            self.start_reading();
            return;
        }
        for connection in pending {
            if let Err(err) = connection.start_setup() {
                tracing::warn!(tunnel_id = %self.id, connection = %connection.id(), error = %err, "Connection setup failed to start");
                self.request_close();
                return;
            }
        }
    }

    fn start_reading(&self) {
        let readers = {
            let state = self.state.lock();
            let mut readers = vec![Arc::clone(&state.source.read)];
            if let Some(destination) = &state.destination {
                readers.push(Arc::clone(&destination.pair.read));
            }
            readers
        };
        for reader in readers {
            if let Err(err) = reader.start_read_remote() {
                tracing::warn!(tunnel_id = %self.id, connection = %reader.id(), error = %err, "Can not start reading");
                self.request_close();
                return;
            }
        }
    }

    fn request_close(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.context.host.upgrade() {
            Some(host) => host.close_tunnel(self.id),
            None => {
                if let Some(me) = self.me.upgrade() {
                    self.context.handle.spawn(async move { me.close().await });
                }
            }
        }
    }

    /// Replace a failed destination: recreate it in place once when its
    /// endpoint allows, otherwise move on to the next destination. New
    /// source connections, when given, replace the current ones. Returns
    /// false when no destination is left or the source went away meanwhile.
    pub async fn switch(&self, new_source: Option<ConnectionPair>) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        let (failed, old_source, from, previous_index, in_place) = {
            let mut state = self.state.lock();
            let Some(failed) = state.destination.take() else {
                return false;
            };
            let ready = failed.endpoint.addresses.read().is_ready_to_recreate_remote_connection()
                && failed.endpoint.addresses.write().is_ready_to_recreate_remote_connection();
            let in_place = ready && !state.recreated_in_place;
            let from = if in_place { failed.index } else { failed.index + 1 };
            let old_source = new_source.as_ref().map(|pair| {
                state.track(pair);
                state.source_lost = false;
                std::mem::replace(&mut state.source, pair.clone())
            });
            state.setup_failed = false;
            state.setup_pending.clear();
            let index = failed.index;
            (failed, old_source, from, index, in_place)
        };
        failed.pair.close();
        if let Some(old) = old_source {
            old.close();
        }

        let destination =
            match create_destination_connections(&self.rule, self.id, from, &self.context.settings)
                .await
            {
                Ok(destination) => destination,
                Err(err) => {
                    self.rule.errors_treatment.report(&self.rule.name, &err.to_string());
                    return false;
                }
            };
        {
            let mut state = self.state.lock();
            state.recreated_in_place = in_place && destination.index == previous_index;
            state.track(&destination.pair);
            state.destination = Some(destination);
        }
        if let Err(err) = self.init() {
            self.rule.errors_treatment.report(&self.rule.name, &err.to_string());
            return false;
        }
        self.alive.store(true, Ordering::Release);
        if self.is_source_lost() {
            self.alive.store(false, Ordering::Release);
            tracing::debug!(tunnel_id = %self.id, "Source closed while switching destination");
            return false;
        }
        tracing::info!(
            rule = %self.rule.name,
            tunnel_id = %self.id,
            destination = %self.destination_identifier(),
            "Tunnel switched destination"
        );
        self.start_setup();
        true
    }

    /// A close request from the source is swallowed while the tunnel is not
    /// alive, so it is checked here once a switch completes. A request raised
    /// after `alive` is set goes through [`TunnelHost::close_tunnel`].
    fn is_source_lost(&self) -> bool {
        let state = self.state.lock();
        state.source_lost || state.source.unique().iter().any(|c| c.is_closing())
    }

    /// Disconnect the wiring, close every connection and wait until all of
    /// them are gone.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alive.store(false, Ordering::Release);
        let connections = {
            let state = self.state.lock();
            let mut all = state.tracked.clone();
            for connection in state.current() {
                if !all.iter().any(|c| c.id() == connection.id()) {
                    all.push(connection);
                }
            }
            all
        };
        for connection in &connections {
            connection.set_signal(None);
        }
        for connection in &connections {
            connection.close();
        }
        for connection in &connections {
            connection.closed().await;
        }
        tracing::info!(tunnel_id = %self.id, rule = %self.rule.name, "Closed tunnel");
    }
}

impl ConnectionSignal for Tunnel {
    fn on_connection_setup_completed(&self, connection: ConnectionId) {
        let ready = {
            let mut state = self.state.lock();
            state.setup_pending.remove(&connection) && state.setup_pending.is_empty()
        };
        if ready {
            self.start_reading();
        }
    }

    fn on_new_message_block(&self, connection: ConnectionId, block: MessageBlock) -> bool {
        let route = {
            let state = self.state.lock();
            let destination = state.destination.as_ref();
            if state.source.read.id() == connection {
                destination.map(|d| (Arc::clone(&state.to_destination), Arc::clone(&d.pair.write)))
            } else if destination.map(|d| d.pair.read.id() == connection).unwrap_or(false) {
                Some((Arc::clone(&state.to_source), Arc::clone(&state.source.write)))
            } else {
                None
            }
        };
        let Some((chain, target)) = route else {
            return false;
        };
        match chain.process(&block) {
            DataTransferCommand::Send => target.send_to_remote(block),
            DataTransferCommand::Skip => false,
            DataTransferCommand::CloseTunnel => {
                tracing::debug!(tunnel_id = %self.id, "Listener asked to close tunnel");
                self.request_close();
                false
            }
        }
    }

    fn on_message_block_sent(&self, connection: ConnectionId) {
        let reader = {
            let state = self.state.lock();
            match &state.destination {
                Some(d) if d.pair.write.id() == connection => Some(Arc::clone(&state.source.read)),
                Some(d) if state.source.write.id() == connection => Some(Arc::clone(&d.pair.read)),
                _ => None,
            }
        };
        if let Some(reader) = reader {
            reader.on_peer_block_sent();
        }
    }

    fn on_connection_close(&self, connection: ConnectionId) {
        {
            let mut state = self.state.lock();
            let failed_destination = state
                .destination
                .as_ref()
                .filter(|d| d.pair.contains(connection))
                .map(|d| {
                    d.pair
                        .unique()
                        .iter()
                        .any(|c| c.id() == connection && c.setup_state() == SetupState::Failed)
                })
                .unwrap_or(false);
            if failed_destination {
                state.setup_failed = true;
            }
            if state.source.contains(connection) {
                state.source_lost = true;
            }
        }
        tracing::debug!(tunnel_id = %self.id, connection = %connection, "Connection asks to close tunnel");
        self.request_close();
    }

    fn on_connection_closed(&self, connection: ConnectionId) {
        tracing::trace!(tunnel_id = %self.id, connection = %connection, "Tunnel connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EndpointConfig, ErrorsTreatment, TunnelRuleConfig};
    use crate::net::io::ConnectionIo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct NoHost;

    impl TunnelHost for NoHost {
        fn close_tunnel(&self, _: TunnelId) {}
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("tcp://{addr}")
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("tcp://{addr}")
    }

    fn rule(destinations: &[String]) -> Arc<TunnelRule> {
        let endpoint = |address: &str| EndpointConfig {
            address: Some(address.to_string()),
            open_timeout_secs: 2,
            ..EndpointConfig::default()
        };
        let config = TunnelRuleConfig {
            uuid: None,
            name: "relay-test".to_string(),
            enabled: true,
            errors_treatment: ErrorsTreatment::Info,
            inputs: vec![endpoint("tcp://127.0.0.1:0")],
            destinations: destinations.iter().map(|d| endpoint(d)).collect(),
            filters: vec![],
            accepted_connections_limit: 0,
        };
        Arc::new(TunnelRule::from_config(&config).unwrap())
    }

    async fn source() -> (ConnectionPair, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(format!("tcp://{peer}"), ConnectionSettings::default(), ConnectionIo::tcp(server));
        (ConnectionPair::combined(connection), client)
    }

    fn context(host: &Arc<NoHost>) -> TunnelContext {
        let host: Arc<dyn TunnelHost> = host.clone();
        TunnelContext {
            handle: Handle::current(),
            host: Arc::downgrade(&host),
            listeners: Arc::new(ListenerFactory::with_defaults()),
            settings: ConnectionSettings::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failover_skips_dead_destinations_and_relays() {
        let host = Arc::new(NoHost);
        let live = echo_server().await;
        let rule = rule(&[closed_port().await, closed_port().await, live.clone()]);
        let (pair, mut client) = source().await;
        let input = Arc::clone(&rule.inputs[0]);
        let tunnel = Tunnel::create(context(&host), rule, input, pair, false).await.unwrap();
        assert_eq!(tunnel.destination_index(), Some(2));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        let connections = tunnel.connections();
        tunnel.close().await;
        assert!(connections.iter().all(|c| c.is_closed()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_destinations_failing_is_destination_opening_error() {
        let host = Arc::new(NoHost);
        let rule = rule(&[closed_port().await, closed_port().await]);
        let (pair, _client) = source().await;
        let source_connection = Arc::clone(&pair.read);
        let input = Arc::clone(&rule.inputs[0]);
        let err = Tunnel::create(context(&host), rule, input, pair, false)
            .await
            .err()
            .unwrap();
        assert!(err.is_destination_opening());
        source_connection.closed().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn switch_recreates_then_advances() {
        let host = Arc::new(NoHost);
        let first = echo_server().await;
        let second = echo_server().await;
        let rule = rule(&[first, second]);
        let (pair, _client) = source().await;
        let input = Arc::clone(&rule.inputs[0]);
        let tunnel = Tunnel::create(context(&host), rule, input, pair, false).await.unwrap();
        assert_eq!(tunnel.destination_index(), Some(0));

        assert!(tunnel.switch(None).await);
        assert_eq!(tunnel.destination_index(), Some(0));
        assert!(tunnel.switch(None).await);
        assert_eq!(tunnel.destination_index(), Some(1));
        assert!(tunnel.switch(None).await);
        assert_eq!(tunnel.destination_index(), Some(1));
        assert!(!tunnel.switch(None).await);
        tunnel.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn source_closing_during_failover_is_not_revived() {
        let host = Arc::new(NoHost);
        let rule = rule(&[echo_server().await, echo_server().await]);
        let (pair, client) = source().await;
        let source_id = pair.read.id();
        let input = Arc::clone(&rule.inputs[0]);
        let tunnel = Tunnel::create(context(&host), rule, input, pair, false).await.unwrap();

        let destination_id = tunnel.connections()[1].id();
        tunnel.on_connection_close(destination_id);
        assert!(!tunnel.is_alive());
        // The source hangs up before the switch runs.
        drop(client);
        tunnel.on_connection_close(source_id);

        assert!(!tunnel.switch(None).await);
        assert!(!tunnel.is_alive());
        tunnel.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn new_source_clears_lost_source() {
        let host = Arc::new(NoHost);
        let rule = rule(&[echo_server().await, echo_server().await]);
        let (pair, _client) = source().await;
        let source_id = pair.read.id();
        let input = Arc::clone(&rule.inputs[0]);
        let tunnel = Tunnel::create(context(&host), rule, input, pair, false).await.unwrap();

        tunnel.on_connection_close(source_id);
        let (replacement, mut client) = source().await;
        assert!(tunnel.switch(Some(replacement)).await);
        assert!(tunnel.is_alive());

        client.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"back");
        tunnel.close().await;
    }
}
