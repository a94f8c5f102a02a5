//! `tcp://host:port` endpoints.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};

use crate::endpoint::{EndpointAddress, EndpointKind};
use crate::error::{Error, Result};
use crate::net::acceptor::{Acceptor, Incoming};
use crate::net::connection::{Connection, ConnectionSettings};
use crate::net::io::ConnectionIo;
use crate::rule::RuleEndpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEndpointAddress {
    address: String,
}

impl TcpEndpointAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

async fn dial(address: String, settings: ConnectionSettings) -> Result<Arc<Connection>> {
    let stream = match tokio::time::timeout(settings.open_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(Error::connection(format!("connecting to tcp://{address}: {err}"), err)),
        Err(_) => {
            return Err(Error::Connection {
                message: format!(
                    "connecting to tcp://{address} timed out after {:?}",
                    settings.open_timeout
                ),
                source: None,
            })
        }
    };
    let peer = stream
        .peer_addr()
        .map(|peer| format!("tcp://{peer}"))
        .unwrap_or_else(|_| format!("tcp://{address}"));
    tracing::debug!(peer = %peer, "TCP connection established");
    Ok(Connection::new(peer, settings, ConnectionIo::tcp(stream)))
}

impl EndpointAddress for TcpEndpointAddress {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Tcp
    }

    fn resource_identifier(&self) -> String {
        format!("tcp://{}", self.address)
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
            let listener = TcpListener::bind(&self.address).await.map_err(|err| {
                Error::system(format!("binding tcp://{}", self.address), err)
            })?;
            let local = listener
                .local_addr()
                .map_err(|err| Error::system("reading bound address", err))?;
            tracing::info!(address = %local, endpoint = %endpoint.uuid, "Listener bound");
            let acceptor: Arc<dyn Acceptor> = Arc::new(TcpAcceptor { listener, local });
            Ok(acceptor)
        }
        .boxed()
    }

    fn create_remote_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>> {
        dial(self.address.clone(), settings).boxed()
    }

    fn create_local_connection(
        self: Arc<Self>,
        _endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>> {
        dial(self.address.clone(), settings).boxed()
    }

    fn is_ready_to_recreate_local_connection(&self) -> bool {
        true
    }

    fn is_ready_to_recreate_remote_connection(&self) -> bool {
        true
    }
}

/// Listening TCP socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl Acceptor for TcpAcceptor {
    fn local_address(&self) -> String {
        format!("tcp://{}", self.local)
    }

    fn incoming(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        async move {
            let (stream, peer) = self.listener.accept().await?;
            Ok(Incoming::Stream { stream, peer })
        }
        .boxed()
    }

    fn try_to_attach(&self, incoming: Incoming) -> Option<Incoming> {
        Some(incoming)
    }

    fn accept(&self, incoming: Incoming, settings: ConnectionSettings) -> Result<Arc<Connection>> {
        match incoming {
            Incoming::Stream { stream, peer } => Ok(Connection::new(
                format!("tcp://{peer}"),
                settings,
                ConnectionIo::tcp(stream),
            )),
            Incoming::Datagram { peer, .. } => Err(Error::Logical(format!(
                "TCP acceptor {} got a datagram from {peer}",
                self.local
            ))),
        }
    }
}
