//! Destination failover.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tunnelex::endpoint::{EndpointAddress, EndpointKind};
use tunnelex::net::acceptor::Acceptor;
use tunnelex::net::connection::{Connection, ConnectionSettings, Handshake};
use tunnelex::net::io::ConnectionIo;
use tunnelex::rule::{EndpointAddresses, RuleEndpoint};
use tunnelex::{Error, ServerWorker, TunnelRule};

mod common;

/// TCP destination whose connections dial fine but fail their setup.
#[derive(Debug)]
struct RejectingHandshake {
    target: SocketAddr,
    dials: AtomicUsize,
}

impl RejectingHandshake {
    fn new(target: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            target,
            dials: AtomicUsize::new(0),
        })
    }
}

impl EndpointAddress for RejectingHandshake {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Tcp
    }

    fn resource_identifier(&self) -> String {
        format!("tcp://{}", self.target)
    }

    fn is_has_multi_clients_type(&self) -> bool {
        true
    }

    fn open_for_incoming_connections(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        _settings: ConnectionSettings,
    ) -> BoxFuture<'static, tunnelex::Result<Arc<dyn Acceptor>>> {
        async { Err(Error::Endpoint("destination only".to_string())) }.boxed()
    }

    fn create_remote_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, tunnelex::Result<Arc<Connection>>> {
        async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let stream = tokio::net::TcpStream::connect(self.target)
                .await
                .map_err(|err| Error::connection("dialing handshake destination", err))?;
            let handshake: Handshake = Box::pin(async { Err("handshake rejected".to_string()) });
            Ok(Connection::with_handshake(
                self.resource_identifier(),
                settings,
                ConnectionIo::tcp(stream),
                Some(handshake),
            ))
        }
        .boxed()
    }

    fn create_local_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        _settings: ConnectionSettings,
    ) -> BoxFuture<'static, tunnelex::Result<Arc<Connection>>> {
        async { Err(Error::Endpoint("destination only".to_string())) }.boxed()
    }

    fn is_ready_to_recreate_local_connection(&self) -> bool {
        false
    }

    fn is_ready_to_recreate_remote_connection(&self) -> bool {
        false
    }
}

/// Swap the address behind destination `index`.
fn with_destination(mut rule: TunnelRule, index: usize, address: Arc<dyn EndpointAddress>) -> TunnelRule {
    let mut endpoint = RuleEndpoint::clone(&rule.destinations[index]);
    endpoint.addresses = EndpointAddresses::Combined(address);
    rule.destinations[index] = Arc::new(endpoint);
    rule
}

#[test]
fn first_working_destination_is_used() {
    let dead = common::closed_port();
    let second = common::start_tagged_server(b"B");
    let third = common::start_tagged_server(b"C");
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = common::tcp_rule("failover", &[dead, second, third]);
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert_eq!(common::read_exactly(&mut client, 1), b"B");
    assert_eq!(common::round_trip(&mut client, b"ping"), b"ping");
}

#[test]
fn client_is_closed_when_every_destination_fails() {
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = common::tcp_rule("nowhere", &[common::closed_port(), common::closed_port()]);
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert!(common::is_closed_by_peer(&mut client));
    assert_eq!(worker.tunnels_number(), 0);
    assert!(worker.is_rule_active(rule.uuid), "a failed tunnel does not deactivate its rule");
}

#[test]
fn destination_closing_ends_the_tunnel() {
    let echo = common::start_echo_server();
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = common::tcp_rule("short", &[echo]);
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert_eq!(common::round_trip(&mut client, b"x"), b"x");
    client.shutdown(std::net::Shutdown::Write).unwrap();
    assert!(common::is_closed_by_peer(&mut client));
    assert!(common::wait_until(Duration::from_secs(5), || worker.tunnels_number() == 0));
}

#[test]
fn failed_setup_switches_to_next_destination() {
    let rejecting = RejectingHandshake::new(common::start_tagged_server(b"A"));
    let second = common::start_tagged_server(b"B");
    let worker = ServerWorker::start(common::options()).unwrap();
    let placeholder = common::closed_port();
    let rule = with_destination(
        common::tcp_rule("handshake", &[placeholder, second]),
        0,
        Arc::clone(&rejecting) as Arc<dyn EndpointAddress>,
    );
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert_eq!(common::read_exactly(&mut client, 1), b"B");
    assert_eq!(common::round_trip(&mut client, b"ping"), b"ping");
    assert_eq!(rejecting.dials.load(Ordering::SeqCst), 1);
    assert!(common::wait_until(Duration::from_secs(5), || worker.tunnels_number() == 1));

    drop(client);
    assert!(common::wait_until(Duration::from_secs(5), || worker.tunnels_number() == 0));
}

#[test]
fn failed_setup_without_next_destination_closes_client() {
    let first = RejectingHandshake::new(common::start_echo_server());
    let last = RejectingHandshake::new(common::start_echo_server());
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = common::tcp_rule("handshake-exhausted", &[common::closed_port(), common::closed_port()]);
    let rule = with_destination(rule, 0, Arc::clone(&first) as Arc<dyn EndpointAddress>);
    let rule = with_destination(rule, 1, Arc::clone(&last) as Arc<dyn EndpointAddress>);
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert!(common::is_closed_by_peer(&mut client));
    assert!(common::wait_until(Duration::from_secs(5), || worker.tunnels_number() == 0));
    assert_eq!(first.dials.load(Ordering::SeqCst), 1);
    assert_eq!(last.dials.load(Ordering::SeqCst), 1);
    assert!(worker.is_rule_active(rule.uuid));
}
