//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Drive the read, write and idle loops on the proactor runtime
//! - Apply read backpressure against the peer's write queue
//! - Delete exactly once, after every outstanding operation has finished
//!
//! ```text
//! NotAllowed ──setup──→ NotStarted ──start_read──→ Reading ⇄ NotReading
//!                                                     │
//!                    close (flush queued writes) ─────┘
//!                    → last operation reference dropped → closed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};

use crate::buffer::latency::LatencyPeriods;
use crate::buffer::{
    MessageBlock, MessagePool, PoolConfig, DEFAULT_CONNECTION_BUFFER_SIZE,
    DEFAULT_DATA_BLOCK_SIZE, MESSAGE_QUEUE_BUFFER_SIZE,
};
use crate::error::{Error, Result};
use crate::net::io::{is_benign, BlockReader, BlockWriter, ConnectionIo};
use crate::net::signal::ConnectionSignal;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Direction a connection is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    pub fn reads(&self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }

    fn covers(&self, requested: Mode) -> bool {
        *self == requested || *self == Mode::ReadWrite
    }
}

/// Read side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Setup has not completed yet.
    NotAllowed,
    NotStarted,
    Reading,
    NotReading,
}

/// Application-level setup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Optional application-level handshake run by [`Connection::start_setup`].
pub type Handshake = BoxFuture<'static, std::result::Result<(), String>>;

/// Tunables for a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub block_size: usize,
    pub connection_buffer_size: usize,
    pub open_timeout: Duration,
    /// Zero disables the idle timer.
    pub idle_timeout: Duration,
    /// How long a closing connection may spend flushing its write queue.
    pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_DATA_BLOCK_SIZE,
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            open_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
            close_timeout: Duration::from_secs(5),
        }
    }
}

enum WriteCommand {
    Block(MessageBlock),
    Finish,
}

struct Inner {
    mode: Option<Mode>,
    handle: Option<Handle>,
    signal: Option<Weak<dyn ConnectionSignal>>,
    read_state: ReadState,
    read_suspended: bool,
    setup: SetupState,
    closing: bool,
    reader: Option<Box<dyn BlockReader>>,
    writer: Option<Box<dyn BlockWriter>>,
    handshake: Option<Handshake>,
    write_tx: Option<mpsc::UnboundedSender<WriteCommand>>,
}

/// One end of a relayed data stream.
pub struct Connection {
    id: ConnectionId,
    identifier: String,
    settings: ConnectionSettings,
    opened_at: Instant,
    /// Milliseconds since `opened_at` of the last read or write.
    last_activity_ms: AtomicU64,
    inner: Mutex<Inner>,
    pool: OnceLock<MessagePool>,
    /// Blocks handed to the peer and not yet written by it.
    in_flight: AtomicUsize,
    queue_capacity: usize,
    read_wakeup: Notify,
    refs: AtomicUsize,
    deleted: AtomicBool,
    closing_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    latency: Mutex<LatencyPeriods>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Keeps a connection from being deleted while an operation is outstanding.
pub(crate) struct OperationRef {
    connection: Arc<Connection>,
}

impl std::ops::Deref for OperationRef {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for OperationRef {
    fn drop(&mut self) {
        self.connection.release_ref();
    }
}

impl Connection {
    /// Wrap an established I/O handle. `identifier` names the peer in logs.
    pub fn new(identifier: impl Into<String>, settings: ConnectionSettings, io: ConnectionIo) -> Arc<Self> {
        Self::with_handshake(identifier, settings, io, None)
    }

    pub fn with_handshake(
        identifier: impl Into<String>,
        settings: ConnectionSettings,
        io: ConnectionIo,
        handshake: Option<Handshake>,
    ) -> Arc<Self> {
        let block_size = settings.block_size.max(1);
        Arc::new(Self {
            id: ConnectionId::new(),
            identifier: identifier.into(),
            settings,
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                mode: None,
                handle: None,
                signal: None,
                read_state: ReadState::NotAllowed,
                read_suspended: false,
                setup: SetupState::Pending,
                closing: false,
                reader: Some(io.reader),
                writer: Some(io.writer),
                handshake,
                write_tx: None,
            }),
            pool: OnceLock::new(),
            in_flight: AtomicUsize::new(0),
            queue_capacity: (MESSAGE_QUEUE_BUFFER_SIZE / block_size).max(1),
            read_wakeup: Notify::new(),
            refs: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
            closing_tx: watch::channel(false).0,
            abort_tx: watch::channel(false).0,
            closed_tx: watch::channel(false).0,
            latency: Mutex::new(LatencyPeriods::default()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer description, e.g. `tcp://127.0.0.1:40512`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn mode(&self) -> Option<Mode> {
        self.inner.lock().mode
    }

    pub fn read_state(&self) -> ReadState {
        self.inner.lock().read_state
    }

    pub fn setup_state(&self) -> SetupState {
        self.inner.lock().setup
    }

    pub fn is_setup_completed(&self) -> bool {
        self.setup_state() == SetupState::Completed
    }

    pub fn is_closing(&self) -> bool {
        *self.closing_tx.borrow()
    }

    /// True once the connection has been deleted.
    pub fn is_closed(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Bind to the proactor and start the I/O machinery for `mode`.
    ///
    /// Re-opening in a mode the connection already covers only rebinds the
    /// signal; any other re-open is a logical error.
    pub fn open(
        self: &Arc<Self>,
        handle: &Handle,
        signal: Weak<dyn ConnectionSignal>,
        mode: Mode,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closing {
            return Err(Error::Logical(format!("connection {} is already closed", self.id)));
        }
        if let Some(current) = inner.mode {
            if current.covers(mode) {
                inner.signal = Some(signal);
                return Ok(());
            }
            return Err(Error::Logical(format!(
                "connection {} is already opened for {current:?}, can not open for {mode:?}",
                self.id
            )));
        }

        let pool_config = if mode.reads() {
            PoolConfig::with_budget(self.settings.block_size, self.settings.connection_buffer_size)
        } else {
            PoolConfig::write_only(self.settings.block_size)
        };
        let _ = self.pool.set(MessagePool::new(pool_config));

        if mode.writes() {
            let writer = inner
                .writer
                .take()
                .ok_or_else(|| Error::Logical(format!("connection {} has no writer", self.id)))?;
            let (tx, rx) = mpsc::unbounded_channel();
            inner.write_tx = Some(tx);
            handle.spawn(Arc::clone(self).write_loop(self.acquire(), writer, rx));
        }
        if mode.reads() {
            let reader = inner
                .reader
                .take()
                .ok_or_else(|| Error::Logical(format!("connection {} has no reader", self.id)))?;
            handle.spawn(Arc::clone(self).read_loop(self.acquire(), reader));
        }

        inner.mode = Some(mode);
        inner.handle = Some(handle.clone());
        inner.signal = Some(signal);
        tracing::trace!(connection = %self.id, ?mode, peer = %self.identifier, "Connection opened");
        Ok(())
    }

    /// Run the application-level handshake, or complete setup at once when
    /// there is none. The outcome is reported through the signal.
    pub fn start_setup(self: &Arc<Self>) -> Result<()> {
        let (handle, handshake) = {
            let mut inner = self.inner.lock();
            if inner.closing {
                return Ok(());
            }
            match inner.setup {
                SetupState::Pending => {}
                SetupState::Completed | SetupState::InProgress => return Ok(()),
                SetupState::Failed => {
                    return Err(Error::Logical(format!("setup of {} has already failed", self.id)))
                }
            }
            let handle = inner
                .handle
                .clone()
                .ok_or_else(|| Error::Logical(format!("connection {} is not opened", self.id)))?;
            inner.setup = SetupState::InProgress;
            (handle, inner.handshake.take())
        };

        let op = self.acquire();
        let timeout = self.settings.open_timeout;
        handle.spawn(async move {
            let outcome = match handshake {
                None => Ok(()),
                Some(handshake) => match tokio::time::timeout(timeout, handshake).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("setup timed out after {timeout:?}")),
                },
            };
            match outcome {
                Ok(()) => op.connection.setup(),
                Err(reason) => op.cancel_setup(&reason),
            }
        });
        Ok(())
    }

    /// Mark setup as completed: reads become allowed and the idle timer starts.
    pub fn setup(self: &Arc<Self>) {
        let (signal, handle) = {
            let mut inner = self.inner.lock();
            if inner.closing || inner.setup == SetupState::Completed {
                return;
            }
            inner.setup = SetupState::Completed;
            if inner.read_state == ReadState::NotAllowed {
                inner.read_state = ReadState::NotStarted;
            }
            (Self::upgrade(&inner), inner.handle.clone())
        };
        self.touch(Instant::now());
        if let Some(handle) = handle {
            if !self.settings.idle_timeout.is_zero() {
                handle.spawn(Arc::clone(self).idle_loop(self.acquire()));
            }
        }
        if let Some(signal) = signal {
            signal.on_connection_setup_completed(self.id);
        }
    }

    /// Fail setup; the owner is asked to close the connection.
    pub fn cancel_setup(&self, reason: &str) {
        let signal = {
            let mut inner = self.inner.lock();
            if inner.closing || inner.setup == SetupState::Completed {
                return;
            }
            inner.setup = SetupState::Failed;
            Self::upgrade(&inner)
        };
        tracing::debug!(connection = %self.id, peer = %self.identifier, reason, "Connection setup canceled");
        if let Some(signal) = signal {
            signal.on_connection_close(self.id);
        }
    }

    pub fn start_read_remote(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.read_state {
            ReadState::NotAllowed => Err(Error::Logical(format!(
                "connection {} can not read before setup is completed",
                self.id
            ))),
            ReadState::Reading => Ok(()),
            ReadState::NotStarted | ReadState::NotReading => {
                if !inner.mode.map(|m| m.reads()).unwrap_or(false) {
                    return Err(Error::Logical(format!("connection {} is not opened for reading", self.id)));
                }
                inner.read_state = ReadState::Reading;
                drop(inner);
                self.read_wakeup.notify_one();
                Ok(())
            }
        }
    }

    pub fn stop_read_remote(&self) {
        let mut inner = self.inner.lock();
        if inner.read_state == ReadState::Reading {
            inner.read_state = ReadState::NotReading;
        }
    }

    /// Allocate a block from this connection's pool.
    pub fn create_message_block(&self, size: usize, data: Option<&[u8]>) -> Result<MessageBlock> {
        let pool = self.pool();
        match data {
            Some(data) => pool.allocate_with(data),
            None => {
                let buf = pool.allocate(size)?;
                Ok(buf.freeze())
            }
        }
    }

    /// Queue a block for writing to the peer. Returns false when the
    /// connection no longer accepts writes.
    pub fn send_to_remote(&self, block: MessageBlock) -> bool {
        if let Some(at) = block.last_activity() {
            self.touch(at);
        }
        let inner = self.inner.lock();
        if inner.closing {
            return false;
        }
        match &inner.write_tx {
            Some(tx) => tx.send(WriteCommand::Block(block)).is_ok(),
            None => false,
        }
    }

    /// Hand a received block to the owner's listener chain.
    pub fn send_to_tunnel(&self, block: MessageBlock) {
        if let Some(at) = block.last_activity() {
            self.touch(at);
        }
        let signal = {
            let inner = self.inner.lock();
            if inner.closing {
                return;
            }
            Self::upgrade(&inner)
        };
        let Some(signal) = signal else { return };
        if signal.on_new_message_block(self.id, block) {
            let queued = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
            if queued >= self.queue_capacity {
                let mut inner = self.inner.lock();
                if !inner.read_suspended {
                    inner.read_suspended = true;
                    tracing::trace!(connection = %self.id, queued, "Reading suspended");
                }
            }
        }
    }

    /// The peer wrote one of the blocks this connection handed over.
    pub fn on_peer_block_sent(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous.saturating_sub(1) < self.queue_capacity / 2 {
            let mut inner = self.inner.lock();
            if inner.read_suspended {
                inner.read_suspended = false;
                drop(inner);
                tracing::trace!(connection = %self.id, "Reading resumed");
                self.read_wakeup.notify_one();
            }
        }
    }

    /// Replace the signal; `None` disconnects all callbacks.
    pub fn set_signal(&self, signal: Option<Weak<dyn ConnectionSignal>>) {
        self.inner.lock().signal = signal;
    }

    /// Logical close. Queued writes are flushed first, bounded by the close
    /// timeout; afterwards no block callbacks are delivered.
    pub fn close(self: &Arc<Self>) {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.closing {
                return;
            }
            inner.closing = true;
            inner.read_state = match inner.read_state {
                ReadState::NotAllowed => ReadState::NotAllowed,
                _ => ReadState::NotReading,
            };
            if let Some(tx) = inner.write_tx.take() {
                let _ = tx.send(WriteCommand::Finish);
            }
            inner.handle.clone()
        };
        self.closing_tx.send_replace(true);
        self.read_wakeup.notify_one();

        if let Some(handle) = handle {
            let weak = Arc::downgrade(self);
            let timeout = self.settings.close_timeout;
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(conn) = weak.upgrade() {
                    if !conn.is_closed() {
                        tracing::debug!(connection = %conn.id, "Close timeout, dropping queued writes");
                        conn.abort_tx.send_replace(true);
                    }
                }
            });
        }
        self.release_ref();
    }

    /// Wait until the connection has been deleted.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Log and rotate the latency statistics.
    pub fn dump_latency_stats(&self) {
        let mut latency = self.latency.lock();
        if !latency.current().is_empty() {
            tracing::debug!(
                connection = %self.id,
                current = %latency.current(),
                lifetime = %latency.lifetime(),
                "Message blocks latency"
            );
        }
        latency.rotate();
    }

    fn pool(&self) -> &MessagePool {
        self.pool.get_or_init(|| {
            MessagePool::new(PoolConfig::with_budget(
                self.settings.block_size,
                self.settings.connection_buffer_size,
            ))
        })
    }

    fn upgrade(inner: &Inner) -> Option<Arc<dyn ConnectionSignal>> {
        inner.signal.as_ref().and_then(Weak::upgrade)
    }

    fn signal(&self) -> Option<Arc<dyn ConnectionSignal>> {
        Self::upgrade(&self.inner.lock())
    }

    fn touch(&self, at: Instant) {
        let offset = at.saturating_duration_since(self.opened_at).as_millis();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(offset, Ordering::AcqRel);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.opened_at.elapsed().saturating_sub(last)
    }

    fn acquire(self: &Arc<Self>) -> OperationRef {
        self.refs.fetch_add(1, Ordering::AcqRel);
        OperationRef {
            connection: Arc::clone(self),
        }
    }

    fn release_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.on_deleted();
        }
    }

    fn on_deleted(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let signal = {
            let mut inner = self.inner.lock();
            inner.reader = None;
            inner.writer = None;
            inner.write_tx = None;
            inner.handshake = None;
            Self::upgrade(&inner)
        };
        {
            let latency = self.latency.lock();
            let lifetime = latency.lifetime();
            if !lifetime.is_empty() {
                tracing::debug!(connection = %self.id, lifetime = %lifetime, "Connection latency at close");
            }
        }
        tracing::trace!(
            connection = %self.id,
            read = self.bytes_read(),
            written = self.bytes_written(),
            "Connection deleted"
        );
        self.closed_tx.send_replace(true);
        if let Some(signal) = signal {
            signal.on_connection_closed(self.id);
        }
    }

    /// Ask the owner to close, or close directly when nobody owns us.
    fn request_close(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        match self.signal() {
            Some(signal) => signal.on_connection_close(self.id),
            None => self.close(),
        }
    }

    async fn wait_until_readable(&self, closing: &mut watch::Receiver<bool>) -> bool {
        loop {
            let wakeup = self.read_wakeup.notified();
            {
                let inner = self.inner.lock();
                if inner.closing {
                    return false;
                }
                if inner.read_state == ReadState::Reading && !inner.read_suspended {
                    return true;
                }
            }
            tokio::select! {
                _ = wakeup => {}
                _ = closing.wait_for(|c| *c) => return false,
            }
        }
    }

    async fn read_loop(self: Arc<Self>, _op: OperationRef, mut reader: Box<dyn BlockReader>) {
        let mut closing = self.closing_tx.subscribe();
        loop {
            if !self.wait_until_readable(&mut closing).await {
                return;
            }
            let mut buf = match self.pool().allocate(self.settings.block_size) {
                Ok(buf) => buf,
                Err(err) => {
                    tracing::error!(connection = %self.id, error = %err, "Can not allocate read buffer");
                    metrics::connection_error();
                    self.request_close();
                    return;
                }
            };
            buf.mark_receive_start();
            let result = tokio::select! {
                r = reader.read_block(buf.as_mut()) => r,
                _ = closing.wait_for(|c| *c) => return,
            };
            match result {
                Ok(0) => {
                    tracing::debug!(connection = %self.id, peer = %self.identifier, "Connection closed by peer");
                    self.request_close();
                    return;
                }
                Ok(n) => {
                    self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    self.touch(Instant::now());
                    self.send_to_tunnel(buf.freeze());
                }
                Err(err) if is_benign(&err) => {
                    tracing::debug!(connection = %self.id, error = %err, "Connection read ended");
                    self.request_close();
                    return;
                }
                Err(err) => {
                    tracing::warn!(connection = %self.id, peer = %self.identifier, error = %err, "Connection read failed");
                    metrics::connection_error();
                    self.request_close();
                    return;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        _op: OperationRef,
        mut writer: Box<dyn BlockWriter>,
        mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        let mut abort = self.abort_tx.subscribe();
        loop {
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = abort.wait_for(|a| *a) => return,
            };
            match command {
                Some(WriteCommand::Block(block)) => {
                    block.mark_send_start();
                    let result = tokio::select! {
                        r = writer.write_block(block.data()) => r,
                        _ = abort.wait_for(|a| *a) => return,
                    };
                    match result {
                        Ok(()) => {
                            block.mark_sent();
                            self.touch(Instant::now());
                            self.bytes_written.fetch_add(block.len() as u64, Ordering::Relaxed);
                            metrics::bytes_relayed(block.len());
                            self.latency.lock().accumulate(&block);
                            drop(block);
                            if !self.is_closing() {
                                if let Some(signal) = self.signal() {
                                    signal.on_message_block_sent(self.id);
                                }
                            }
                        }
                        Err(err) => {
                            if is_benign(&err) {
                                tracing::debug!(connection = %self.id, error = %err, "Connection write ended");
                            } else {
                                tracing::warn!(connection = %self.id, peer = %self.identifier, error = %err, "Connection write failed");
                                metrics::connection_error();
                            }
                            self.request_close();
                            return;
                        }
                    }
                }
                Some(WriteCommand::Finish) | None => {
                    tokio::select! {
                        _ = writer.shutdown() => {}
                        _ = abort.wait_for(|a| *a) => {}
                    }
                    return;
                }
            }
        }
    }

    async fn idle_loop(self: Arc<Self>, _op: OperationRef) {
        let timeout = self.settings.idle_timeout;
        let mut closing = self.closing_tx.subscribe();
        let mut wait = timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = closing.wait_for(|c| *c) => return,
            }
            let idle = self.idle_for();
            if idle >= timeout {
                tracing::debug!(connection = %self.id, idle_ms = idle.as_millis() as u64, "Connection idle timeout");
                self.request_close();
                return;
            }
            wait = timeout - idle;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.identifier)
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct Recorder {
        setup: AtomicUsize,
        blocks: Mutex<Vec<Vec<u8>>>,
        sent: AtomicUsize,
        close_requests: AtomicUsize,
        closed: AtomicUsize,
        close_on_request: Mutex<Option<Arc<Connection>>>,
    }

    impl ConnectionSignal for Recorder {
        fn on_connection_setup_completed(&self, _: ConnectionId) {
            self.setup.fetch_add(1, Ordering::SeqCst);
        }

        fn on_new_message_block(&self, _: ConnectionId, block: MessageBlock) -> bool {
            self.blocks.lock().push(block.data().to_vec());
            false
        }

        fn on_message_block_sent(&self, _: ConnectionId) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connection_close(&self, _: ConnectionId) {
            self.close_requests.fetch_add(1, Ordering::SeqCst);
            if let Some(conn) = self.close_on_request.lock().take() {
                conn.close();
            }
        }

        fn on_connection_closed(&self, _: ConnectionId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(format!("tcp://{addr}"), ConnectionSettings::default(), ConnectionIo::tcp(server)), client)
    }

    fn as_signal(recorder: &Arc<Recorder>) -> Weak<dyn ConnectionSignal> {
        let signal: Arc<dyn ConnectionSignal> = recorder.clone();
        Arc::downgrade(&signal)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check(), "condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_and_writes_after_setup() {
        let (conn, mut peer) = pair().await;
        let recorder = Arc::new(Recorder::default());
        conn.open(&Handle::current(), as_signal(&recorder), Mode::ReadWrite).unwrap();
        assert!(conn.start_read_remote().is_err());

        conn.start_setup().unwrap();
        eventually(|| recorder.setup.load(Ordering::SeqCst) == 1).await;
        conn.start_read_remote().unwrap();

        peer.write_all(b"hello").await.unwrap();
        eventually(|| recorder.blocks.lock().concat() == b"hello").await;

        let block = conn.create_message_block(0, Some(b"world")).unwrap();
        assert!(conn.send_to_remote(block));
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        eventually(|| recorder.sent.load(Ordering::SeqCst) == 1).await;

        conn.close();
        conn.closed().await;
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reopen_in_incompatible_mode_is_logical_error() {
        let (conn, _peer) = pair().await;
        let recorder = Arc::new(Recorder::default());
        conn.open(&Handle::current(), as_signal(&recorder), Mode::Read).unwrap();
        conn.open(&Handle::current(), as_signal(&recorder), Mode::Read).unwrap();
        assert!(matches!(
            conn.open(&Handle::current(), as_signal(&recorder), Mode::Write),
            Err(Error::Logical(_))
        ));
        conn.close();
        conn.closed().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_flushes_pending_writes_and_deletes_once() {
        let (conn, mut peer) = pair().await;
        let recorder = Arc::new(Recorder::default());
        conn.open(&Handle::current(), as_signal(&recorder), Mode::ReadWrite).unwrap();
        for chunk in [&b"ab"[..], b"cd", b"ef"] {
            assert!(conn.send_to_remote(MessageBlock::copy_from(chunk)));
        }
        conn.close();
        conn.close();
        assert!(!conn.send_to_remote(MessageBlock::copy_from(b"late")));

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcdef");
        conn.closed().await;
        assert!(conn.is_closed());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_eof_requests_close_and_no_blocks_after_close() {
        let (conn, peer) = pair().await;
        let recorder = Arc::new(Recorder::default());
        *recorder.close_on_request.lock() = Some(Arc::clone(&conn));
        conn.open(&Handle::current(), as_signal(&recorder), Mode::ReadWrite).unwrap();
        conn.start_setup().unwrap();
        eventually(|| conn.is_setup_completed()).await;
        conn.start_read_remote().unwrap();
        drop(peer);
        conn.closed().await;
        assert_eq!(recorder.close_requests.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert!(recorder.blocks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_timeout_is_not_early_and_is_bounded() {
        let (conn, _peer) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            let settings = ConnectionSettings {
                idle_timeout: Duration::from_millis(300),
                ..ConnectionSettings::default()
            };
            (Connection::new("idle", settings, ConnectionIo::tcp(server)), client)
        };
        let recorder = Arc::new(Recorder::default());
        *recorder.close_on_request.lock() = Some(Arc::clone(&conn));
        conn.open(&Handle::current(), as_signal(&recorder), Mode::ReadWrite).unwrap();
        let started = Instant::now();
        conn.start_setup().unwrap();

        // Activity half way through pushes the deadline.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(conn.send_to_remote(MessageBlock::copy_from(b"x")));

        conn.closed().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(440), "closed too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "closed too late: {elapsed:?}");
        assert_eq!(recorder.close_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_handshake_asks_for_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let handshake: Handshake = Box::pin(async { Err("bad greeting".to_string()) });
        let conn = Connection::with_handshake("hs", ConnectionSettings::default(), ConnectionIo::tcp(server), Some(handshake));
        let recorder = Arc::new(Recorder::default());
        conn.open(&Handle::current(), as_signal(&recorder), Mode::ReadWrite).unwrap();
        conn.start_setup().unwrap();
        eventually(|| recorder.close_requests.load(Ordering::SeqCst) == 1).await;
        assert_eq!(conn.setup_state(), SetupState::Failed);
        assert_eq!(recorder.setup.load(Ordering::SeqCst), 0);
        conn.close();
        conn.closed().await;
    }
}
