//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use tunnelex::config::schema::{EndpointConfig, ErrorsTreatment, TunnelRuleConfig};
use tunnelex::{ServerWorker, TunnelRule, WorkerOptions};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker options sized for tests: small pools, no stats dump, fast checks.
pub fn options() -> WorkerOptions {
    let mut options = WorkerOptions::default();
    options.worker.opening_threads_min = 2;
    options.worker.opening_threads_max = 32;
    options.worker.rules_check_interval_secs = 1;
    options.worker.stats_dump_interval_secs = 0;
    options.worker.close_timeout_secs = 1;
    options
}

/// TCP server echoing every byte back, one thread per client.
pub fn start_echo_server() -> SocketAddr {
    start_tagged_server(b"")
}

/// TCP server that greets each client with `tag`, then echoes.
pub fn start_tagged_server(tag: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                if !tag.is_empty() && stream.write_all(tag).is_err() {
                    return;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP socket echoing every datagram back to its sender.
pub fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 65_535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], peer);
        }
    });
    addr
}

/// An address nobody listens on.
pub fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn endpoint(address: String) -> EndpointConfig {
    EndpointConfig {
        address: Some(address),
        open_timeout_secs: 2,
        ..EndpointConfig::default()
    }
}

pub fn listening_input() -> EndpointConfig {
    endpoint("tcp://127.0.0.1:0".to_string())
}

pub fn tcp_destination(addr: SocketAddr) -> EndpointConfig {
    endpoint(format!("tcp://{addr}"))
}

pub fn rule_config(name: &str, inputs: Vec<EndpointConfig>, destinations: Vec<EndpointConfig>) -> TunnelRuleConfig {
    TunnelRuleConfig {
        uuid: None,
        name: name.to_string(),
        enabled: true,
        errors_treatment: ErrorsTreatment::Info,
        inputs,
        destinations,
        filters: vec![],
        accepted_connections_limit: 0,
    }
}

pub fn tcp_rule(name: &str, destinations: &[SocketAddr]) -> TunnelRule {
    let destinations = destinations.iter().map(|addr| tcp_destination(*addr)).collect();
    TunnelRule::from_config(&rule_config(name, vec![listening_input()], destinations)).unwrap()
}

/// `host:port` the rule's first input is listening on.
pub fn input_address(worker: &ServerWorker, rule: &TunnelRule) -> String {
    let resource = worker
        .real_opened_endpoint_address(rule.uuid, rule.inputs[0].uuid)
        .unwrap();
    resource.split_once("://").map(|(_, rest)| rest.to_string()).unwrap()
}

pub fn connect(address: &str) -> TcpStream {
    let stream = TcpStream::connect(address).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

/// Send `message` and read back exactly as many bytes.
pub fn round_trip(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).unwrap();
    read_exactly(stream, message.len())
}

pub fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// True when the peer closed (EOF or reset) within the read timeout.
pub fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
