//! Accept loops for accepting rule inputs.
//!
//! # Responsibilities
//! - Turn inbound attempts (streams, first datagrams) into [`Incoming`]
//! - Run one accept loop per acceptor on the proactor runtime
//! - Stop as a barrier: `stop` returns only after the loop has exited

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::net::connection::{Connection, ConnectionSettings};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// One inbound connection attempt.
#[derive(Debug)]
pub enum Incoming {
    Stream { stream: TcpStream, peer: SocketAddr },
    Datagram { peer: SocketAddr, payload: Bytes },
}

impl Incoming {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Incoming::Stream { peer, .. } | Incoming::Datagram { peer, .. } => *peer,
        }
    }
}

/// Listening side of an accepting endpoint.
pub trait Acceptor: Send + Sync + fmt::Debug {
    /// Address actually bound, as a resource identifier.
    fn local_address(&self) -> String;

    /// Wait for the next attempt.
    fn incoming(&self) -> BoxFuture<'_, io::Result<Incoming>>;

    /// Hand the attempt to a connection that already exists for the same
    /// peer. Gives the attempt back when nothing took it.
    fn try_to_attach(&self, incoming: Incoming) -> Option<Incoming>;

    /// Create the source connection for an attempt.
    fn accept(&self, incoming: Incoming, settings: ConnectionSettings) -> Result<Arc<Connection>>;
}

/// Receiver of inbound attempts, implemented by the server worker.
pub trait IncomingHandler: Send + Sync {
    fn on_incoming(&self, acceptor: &Arc<dyn Acceptor>, incoming: Incoming);
}

/// Owns the accept loop of one acceptor.
pub struct AcceptHandler {
    acceptor: Arc<dyn Acceptor>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AcceptHandler {
    /// Spawn the accept loop on `handle`.
    pub fn start(handle: &Handle, acceptor: Arc<dyn Acceptor>, handler: Weak<dyn IncomingHandler>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = handle.spawn(accept_loop(Arc::clone(&acceptor), handler, stop_rx));
        tracing::debug!(address = %acceptor.local_address(), "Accept loop started");
        Self {
            acceptor,
            stop_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn acceptor(&self) -> &Arc<dyn Acceptor> {
        &self.acceptor
    }

    /// Stop accepting and wait for the loop to exit.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(address = %self.acceptor.local_address(), "Accept loop panicked");
                }
            }
        }
        tracing::debug!(address = %self.acceptor.local_address(), "Accept loop stopped");
    }
}

impl Drop for AcceptHandler {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

impl fmt::Debug for AcceptHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptHandler")
            .field("acceptor", &self.acceptor)
            .field("stopped", &*self.stop_tx.borrow())
            .finish()
    }
}

async fn accept_loop(
    acceptor: Arc<dyn Acceptor>,
    handler: Weak<dyn IncomingHandler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            result = acceptor.incoming() => result,
            _ = stop.wait_for(|s| *s) => break,
        };
        match result {
            Ok(incoming) => {
                let Some(handler) = handler.upgrade() else { break };
                tracing::trace!(peer = %incoming.peer(), address = %acceptor.local_address(), "Connection attempt");
                handler.on_incoming(&acceptor, incoming);
            }
            Err(err) => {
                tracing::warn!(address = %acceptor.local_address(), error = %err, "Failed to accept");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    _ = stop.wait_for(|s| *s) => break,
                }
            }
        }
    }
}
