//! `destination_ping`: order destinations by TCP connect time.
//!
//! Unreachable destinations and destinations that can not be measured (UDP)
//! go last, keeping their relative order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture, FutureExt};
use tokio::net::TcpStream;

use crate::endpoint::EndpointKind;
use crate::filter::Filter;
use crate::rule::{RuleEndpoint, TunnelRule};

#[derive(Debug, Clone)]
pub struct DestinationPing {
    interval: Duration,
    timeout: Duration,
}

impl DestinationPing {
    pub const NAME: &'static str = "destination_ping";

    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for DestinationPing {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(3))
    }
}

async fn ping(endpoint: Arc<RuleEndpoint>, timeout: Duration) -> Option<Duration> {
    let address = endpoint.addresses.write();
    if address.kind() != EndpointKind::Tcp {
        return None;
    }
    let resource = address.resource_identifier();
    let target = resource.trim_start_matches("tcp://").to_string();
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        _ => None,
    }
}

/// Stable order by measured time, unmeasured last.
fn order(destinations: &[Arc<RuleEndpoint>], times: &[Option<Duration>]) -> Vec<Arc<RuleEndpoint>> {
    let mut ranked: Vec<_> = destinations.iter().cloned().zip(times.iter().copied()).collect();
    ranked.sort_by_key(|(_, time)| (time.is_none(), *time));
    ranked.into_iter().map(|(endpoint, _)| endpoint).collect()
}

impl Filter for DestinationPing {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn change_rule(&self, rule: Arc<TunnelRule>) -> BoxFuture<'static, Option<TunnelRule>> {
        let timeout = self.timeout;
        async move {
            if rule.destinations.len() < 2 {
                return None;
            }
            let times = join_all(
                rule.destinations
                    .iter()
                    .map(|endpoint| ping(Arc::clone(endpoint), timeout)),
            )
            .await;
            let ordered = order(&rule.destinations, &times);
            let unchanged = ordered
                .iter()
                .zip(rule.destinations.iter())
                .all(|(a, b)| a.uuid == b.uuid);
            if unchanged {
                return None;
            }
            tracing::debug!(
                rule = %rule.name,
                order = ?ordered.iter().map(|d| d.addresses.to_string()).collect::<Vec<_>>(),
                "Destinations reordered by ping"
            );
            let mut changed = TunnelRule::clone(&rule);
            changed.destinations = ordered;
            Some(changed)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EndpointConfig, ErrorsTreatment, TunnelRuleConfig};
    use tokio::net::TcpListener;

    fn rule(destinations: Vec<String>) -> Arc<TunnelRule> {
        let endpoint = |address: String| EndpointConfig {
            address: Some(address),
            ..EndpointConfig::default()
        };
        Arc::new(
            TunnelRule::from_config(&TunnelRuleConfig {
                uuid: None,
                name: "ping".into(),
                enabled: true,
                errors_treatment: ErrorsTreatment::Warn,
                inputs: vec![endpoint("tcp://127.0.0.1:0".into())],
                destinations: destinations.into_iter().map(endpoint).collect(),
                filters: vec![DestinationPing::NAME.into()],
                accepted_connections_limit: 0,
            })
            .unwrap(),
        )
    }

    #[test]
    fn unmeasured_go_last_in_stable_order() {
        let rule = rule(vec![
            "udp://127.0.0.1:1".into(),
            "tcp://127.0.0.1:2".into(),
            "tcp://127.0.0.1:3".into(),
            "tcp://127.0.0.1:4".into(),
        ]);
        let times = [
            None,
            Some(Duration::from_millis(5)),
            None,
            Some(Duration::from_millis(1)),
        ];
        let ordered = order(&rule.destinations, &times);
        let uuids: Vec<_> = ordered.iter().map(|d| d.uuid).collect();
        let d = &rule.destinations;
        assert_eq!(uuids, vec![d[3].uuid, d[1].uuid, d[0].uuid, d[2].uuid]);
    }

    #[tokio::test]
    async fn reachable_destination_moves_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = format!("tcp://{}", listener.local_addr().unwrap());
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("tcp://{}", l.local_addr().unwrap())
        };
        let rule = rule(vec![dead, live.clone()]);
        let filter = DestinationPing::new(Duration::from_secs(1), Duration::from_secs(1));
        let changed = filter.change_rule(Arc::clone(&rule)).await.unwrap();
        assert_eq!(changed.destinations[0].addresses.to_string(), live);
        assert!(filter.change_rule(Arc::new(changed)).await.is_none());
    }
}
