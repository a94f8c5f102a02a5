//! Static inputs: the server dials out to the source and reopens it.

use std::net::TcpListener;
use std::time::Duration;

use tunnelex::config::schema::EndpointConfig;
use tunnelex::{ServerWorker, TunnelRule};

mod common;

fn static_input(source: &TcpListener) -> EndpointConfig {
    EndpointConfig {
        acceptor: false,
        ..common::endpoint(format!("tcp://{}", source.local_addr().unwrap()))
    }
}

fn accept(source: &TcpListener) -> std::net::TcpStream {
    source.set_nonblocking(true).unwrap();
    let mut accepted = None;
    assert!(
        common::wait_until(common::IO_TIMEOUT, || {
            accepted = source.accept().ok();
            accepted.is_some()
        }),
        "server did not dial the static source"
    );
    let (stream, _) = accepted.unwrap();
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(common::IO_TIMEOUT)).unwrap();
    stream
}

#[test]
fn static_tunnel_relays_and_reopens_after_close() {
    let echo = common::start_echo_server();
    let source = TcpListener::bind("127.0.0.1:0").unwrap();
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = TunnelRule::from_config(&common::rule_config(
        "static",
        vec![static_input(&source)],
        vec![common::tcp_destination(echo)],
    ))
    .unwrap();
    assert!(worker.update(rule.clone()).unwrap());
    assert_eq!(worker.opened_endpoints_number(), 0);

    let mut first = accept(&source);
    assert_eq!(common::round_trip(&mut first, b"pushed"), b"pushed");
    assert_eq!(worker.tunnels_number(), 1);

    drop(first);
    let mut second = accept(&source);
    assert_eq!(common::round_trip(&mut second, b"again"), b"again");
    assert!(common::wait_until(Duration::from_secs(2), || worker.tunnels_number() == 1));
}

#[test]
fn unreachable_static_source_is_retried_by_rules_check() {
    let echo = common::start_echo_server();
    let reserved = common::closed_port();
    let worker = ServerWorker::start(common::options()).unwrap();
    let input = EndpointConfig {
        acceptor: false,
        ..common::endpoint(format!("tcp://{reserved}"))
    };
    let rule = TunnelRule::from_config(&common::rule_config("retried", vec![input], vec![common::tcp_destination(echo)]))
        .unwrap();
    assert!(!worker.update(rule.clone()).unwrap());
    assert!(worker.is_rule_queued_for_check(rule.uuid));

    let source = TcpListener::bind(reserved).unwrap();
    let mut stream = accept(&source);
    assert_eq!(common::round_trip(&mut stream, b"late"), b"late");
    assert!(common::wait_until(Duration::from_secs(2), || !worker.is_rule_queued_for_check(rule.uuid)));
}

#[test]
fn deleted_rule_does_not_reopen_static_tunnel() {
    let echo = common::start_echo_server();
    let source = TcpListener::bind("127.0.0.1:0").unwrap();
    let worker = ServerWorker::start(common::options()).unwrap();
    let rule = TunnelRule::from_config(&common::rule_config(
        "gone",
        vec![static_input(&source)],
        vec![common::tcp_destination(echo)],
    ))
    .unwrap();
    worker.update(rule.clone()).unwrap();
    let first = accept(&source);

    assert!(worker.delete_rule(rule.uuid).unwrap());
    drop(first);
    assert!(common::wait_until(Duration::from_secs(3), || worker.tunnels_number() == 0));
    std::thread::sleep(Duration::from_millis(500));
    assert!(source.accept().is_err(), "no new dial for a deleted rule");
}
