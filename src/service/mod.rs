//! Services run by service rules.
//!
//! The server worker starts the services of a rule when it is activated,
//! calls `do_work` on every started service from the services loop, and
//! stops them when the rule goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rule::{ServiceInfo, ServiceRule};

pub trait Service: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self);

    /// Periodic work.
    fn do_work(&self) -> Result<()>;
}

pub type ServiceConstructor =
    Arc<dyn Fn(&ServiceRule, &ServiceInfo) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Name-keyed service constructors.
#[derive(Clone, Default)]
pub struct ServiceFactory {
    constructors: HashMap<String, ServiceConstructor>,
}

impl ServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ServiceRule, &ServiceInfo) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn create(&self, rule: &ServiceRule, info: &ServiceInfo) -> Result<Arc<dyn Service>> {
        let constructor = self
            .constructors
            .get(&info.name)
            .ok_or_else(|| Error::Endpoint(format!("unknown service \"{}\"", info.name)))?;
        constructor(rule, info)
    }
}

impl fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A service of an active rule.
pub struct ActiveService {
    pub rule: Arc<ServiceRule>,
    pub info: ServiceInfo,
    service: Arc<dyn Service>,
    started: AtomicBool,
}

impl ActiveService {
    pub fn new(rule: Arc<ServiceRule>, info: ServiceInfo, service: Arc<dyn Service>) -> Self {
        Self {
            rule,
            info,
            service,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        self.service.start()?;
        self.started.store(true, Ordering::Release);
        tracing::info!(rule = %self.rule.name, service = %self.info.name, "Service started");
        Ok(())
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.service.stop();
            tracing::info!(rule = %self.rule.name, service = %self.info.name, "Service stopped");
        }
    }

    /// Errors are reported with the rule's severity.
    pub fn do_work(&self) {
        if !self.is_started() {
            return;
        }
        if let Err(err) = self.service.do_work() {
            self.rule.errors_treatment.report(
                &self.rule.name,
                &format!("service \"{}\" failed: {err}", self.info.name),
            );
        }
    }
}

impl fmt::Debug for ActiveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveService")
            .field("rule", &self.rule.uuid)
            .field("service", &self.info.name)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ErrorsTreatment;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[derive(Default)]
    struct Counting {
        work: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Service for Counting {
        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn do_work(&self) -> Result<()> {
            self.work.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn rule() -> Arc<ServiceRule> {
        Arc::new(ServiceRule {
            uuid: Uuid::new_v4(),
            name: "svc".into(),
            enabled: true,
            errors_treatment: ErrorsTreatment::Warn,
            services: vec![],
        })
    }

    #[test]
    fn work_only_while_started_and_stop_once() {
        let counting = Arc::new(Counting::default());
        let info = ServiceInfo {
            uuid: Uuid::new_v4(),
            name: "counting".into(),
            param: String::new(),
        };
        let active = ActiveService::new(rule(), info, counting.clone());
        active.do_work();
        assert_eq!(counting.work.load(Ordering::SeqCst), 0);
        active.start().unwrap();
        active.do_work();
        active.stop();
        active.stop();
        active.do_work();
        assert_eq!(counting.work.load(Ordering::SeqCst), 1);
        assert_eq!(counting.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_service_is_endpoint_error() {
        let rule = rule();
        let info = ServiceInfo {
            uuid: Uuid::new_v4(),
            name: "upnp".into(),
            param: String::new(),
        };
        assert!(matches!(ServiceFactory::new().create(&rule, &info), Err(Error::Endpoint(_))));
    }
}
