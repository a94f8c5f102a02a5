//! License gates and connection timeouts.

use std::thread;
use std::time::{Duration, Instant};

use tunnelex::config::schema::LicenseConfig;
use tunnelex::license::Licenses;
use tunnelex::{ServerWorker, TunnelRule};

mod common;

#[test]
fn tunnels_beyond_license_are_refused() {
    let echo = common::start_echo_server();
    let mut options = common::options();
    options.licenses = Licenses::from_config(&LicenseConfig {
        max_rules: 0,
        max_tunnels: 1,
    });
    let worker = ServerWorker::start(options).unwrap();
    let rule = common::tcp_rule("licensed", &[echo]);
    worker.update(rule.clone()).unwrap();
    let address = common::input_address(&worker, &rule);

    let mut first = common::connect(&address);
    assert_eq!(common::round_trip(&mut first, b"ok"), b"ok");
    assert!(common::wait_until(Duration::from_secs(2), || worker.tunnels_number() == 1));

    let mut second = common::connect(&address);
    assert!(common::is_closed_by_peer(&mut second));
    assert_eq!(worker.tunnels_number(), 1);
    assert_eq!(common::round_trip(&mut first, b"still ok"), b"still ok");
}

#[test]
fn rules_beyond_license_are_refused_with_license_error() {
    let mut options = common::options();
    options.licenses = Licenses::from_config(&LicenseConfig {
        max_rules: 2,
        max_tunnels: 0,
    });
    let worker = ServerWorker::start(options).unwrap();
    for name in ["one", "two"] {
        assert!(worker.update(common::tcp_rule(name, &[common::closed_port()])).unwrap());
    }
    let third = common::tcp_rule("three", &[common::closed_port()]);
    let err = worker.update(third.clone()).unwrap_err();
    assert!(err.is_license());
    assert!(!worker.is_rule_active(third.uuid));

    let first = common::tcp_rule("one", &[common::closed_port()]);
    assert!(worker.delete_rule(first.uuid).unwrap());
    assert!(worker.update(third).unwrap());
}

#[test]
fn idle_connection_is_closed_after_timeout() {
    let echo = common::start_echo_server();
    let worker = ServerWorker::start(common::options()).unwrap();
    let mut input = common::listening_input();
    input.idle_timeout_secs = 1;
    let rule = TunnelRule::from_config(&common::rule_config("idle", vec![input], vec![common::tcp_destination(echo)]))
        .unwrap();
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    assert_eq!(common::round_trip(&mut client, b"wake"), b"wake");
    let started = Instant::now();
    assert!(common::is_closed_by_peer(&mut client));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "closed too early: {elapsed:?}");
    assert!(common::wait_until(Duration::from_secs(3), || worker.tunnels_number() == 0));
}

#[test]
fn traffic_keeps_idle_connection_open() {
    let echo = common::start_echo_server();
    let worker = ServerWorker::start(common::options()).unwrap();
    let mut input = common::listening_input();
    input.idle_timeout_secs = 1;
    let rule = TunnelRule::from_config(&common::rule_config("busy", vec![input], vec![common::tcp_destination(echo)]))
        .unwrap();
    worker.update(rule.clone()).unwrap();

    let mut client = common::connect(&common::input_address(&worker, &rule));
    for _ in 0..6 {
        assert_eq!(common::round_trip(&mut client, b"tick"), b"tick");
        thread::sleep(Duration::from_millis(400));
    }
}
