//! `udp://host:port` endpoints.
//!
//! The accepting side owns one socket and demultiplexes datagrams by peer
//! address: the first datagram from a peer becomes a new connection, later
//! ones are attached to it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::endpoint::{EndpointAddress, EndpointKind};
use crate::error::{Error, Result};
use crate::net::acceptor::{Acceptor, Incoming};
use crate::net::connection::{Connection, ConnectionSettings};
use crate::net::io::{ConnectionIo, MAX_DATAGRAM_SIZE};
use crate::rule::RuleEndpoint;

/// Datagrams buffered per peer before new ones are dropped.
const PEER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEndpointAddress {
    address: String,
}

impl UdpEndpointAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

async fn connect(address: String, settings: ConnectionSettings) -> Result<Arc<Connection>> {
    let target = tokio::net::lookup_host(&address)
        .await
        .map_err(|err| Error::connection(format!("resolving udp://{address}"), err))?
        .next()
        .ok_or_else(|| Error::Connection {
            message: format!("udp://{address} resolves to nothing"),
            source: None,
        })?;
    let unspecified = match target.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))
        .await
        .map_err(|err| Error::system("binding UDP socket", err))?;
    socket
        .connect(target)
        .await
        .map_err(|err| Error::connection(format!("connecting to udp://{target}"), err))?;
    Ok(Connection::new(
        format!("udp://{target}"),
        settings,
        ConnectionIo::udp_connected(Arc::new(socket)),
    ))
}

impl EndpointAddress for UdpEndpointAddress {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Udp
    }

    fn resource_identifier(&self) -> String {
        format!("udp://{}", self.address)
    }

    fn is_has_multi_clients_type(&self) -> bool {
        true
    }

    fn open_for_incoming_connections(
        self: Arc<Self>,
        endpoint: Arc<RuleEndpoint>,
        _settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<dyn Acceptor>>> {
        async move {
            let socket = UdpSocket::bind(&self.address)
                .await
                .map_err(|err| Error::system(format!("binding udp://{}", self.address), err))?;
            let local = socket
                .local_addr()
                .map_err(|err| Error::system("reading bound address", err))?;
            tracing::info!(address = %local, endpoint = %endpoint.uuid, "UDP socket bound");
            let acceptor: Arc<dyn Acceptor> = Arc::new(UdpAcceptor::new(socket, local));
            Ok(acceptor)
        }
        .boxed()
    }

    fn create_remote_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>> {
        connect(self.address.clone(), settings).boxed()
    }

    fn create_local_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>> {
        connect(self.address.clone(), settings).boxed()
    }

    fn is_ready_to_recreate_local_connection(&self) -> bool {
        true
    }

    fn is_ready_to_recreate_remote_connection(&self) -> bool {
        true
    }
}

/// Bound UDP socket shared by all peer connections.
#[derive(Debug)]
pub struct UdpAcceptor {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peers: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    scratch: tokio::sync::Mutex<Vec<u8>>,
}

impl UdpAcceptor {
    fn new(socket: UdpSocket, local: SocketAddr) -> Self {
        Self {
            socket: Arc::new(socket),
            local,
            peers: Arc::new(DashMap::new()),
            scratch: tokio::sync::Mutex::new(vec![0; MAX_DATAGRAM_SIZE]),
        }
    }

    /// Peers with a live connection.
    pub fn peers(&self) -> usize {
        self.peers.iter().filter(|entry| !entry.value().is_closed()).count()
    }

    /// Entries in the peer table, live or not yet evicted.
    pub fn tracked_peers(&self) -> usize {
        self.peers.len()
    }

    /// Drop the peer's entry once its connection is deleted, unless a newer
    /// connection of the same peer replaced it.
    fn evict_on_close(&self, peer: SocketAddr, tx: mpsc::Sender<Bytes>, connection: &Arc<Connection>) {
        let peers = Arc::downgrade(&self.peers);
        let connection = Arc::clone(connection);
        let evict = async move {
            connection.closed().await;
            if let Some(peers) = peers.upgrade() {
                peers.remove_if(&peer, |_, current| current.same_channel(&tx));
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(evict);
            }
            Err(_) => {
                // Without a runtime the entry is evicted by the next datagram
                // of the same peer.
                tracing::debug!(peer = %peer, "No runtime to watch UDP peer connection");
            }
        }
    }
}

impl Acceptor for UdpAcceptor {
    fn local_address(&self) -> String {
        format!("udp://{}", self.local)
    }

    fn incoming(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        async move {
            let mut scratch = self.scratch.lock().await;
            loop {
                let (n, peer) = self.socket.recv_from(&mut scratch).await?;
                if n > 0 {
                    return Ok(Incoming::Datagram {
                        peer,
                        payload: Bytes::copy_from_slice(&scratch[..n]),
                    });
                }
            }
        }
        .boxed()
    }

    fn try_to_attach(&self, incoming: Incoming) -> Option<Incoming> {
        let (peer, payload) = match incoming {
            Incoming::Datagram { peer, payload } => (peer, payload),
            other => return Some(other),
        };
        let Some(sender) = self.peers.get(&peer).map(|entry| entry.value().clone()) else {
            return Some(Incoming::Datagram { peer, payload });
        };
        match sender.try_send(payload) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(peer = %peer, "Peer queue full, datagram dropped");
                None
            }
            Err(TrySendError::Closed(payload)) => {
                self.peers.remove_if(&peer, |_, tx| tx.is_closed());
                Some(Incoming::Datagram { peer, payload })
            }
        }
    }

    fn accept(&self, incoming: Incoming, settings: ConnectionSettings) -> Result<Arc<Connection>> {
        let (peer, payload) = match incoming {
            Incoming::Datagram { peer, payload } => (peer, payload),
            Incoming::Stream { peer, .. } => {
                return Err(Error::Logical(format!(
                    "UDP acceptor {} got a stream from {peer}",
                    self.local
                )))
            }
        };
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        // Capacity is non-zero and the receiver is alive.
        let _ = tx.try_send(payload);
        self.peers.insert(peer, tx.clone());
        let connection = Connection::new(
            format!("udp://{peer}"),
            settings,
            ConnectionIo::udp_demultiplexed(Arc::clone(&self.socket), peer, rx),
        );
        self.evict_on_close(peer, tx, &connection);
        Ok(connection)
    }
}
