//! Callbacks a connection raises towards its owner.

use crate::buffer::MessageBlock;
use crate::net::connection::ConnectionId;

/// Receiver of connection events, implemented by the tunnel.
///
/// Connections hold the signal weakly and never call it while holding their
/// own lock, so implementations are free to call back into the connection.
pub trait ConnectionSignal: Send + Sync {
    /// Application-level setup finished with success.
    fn on_connection_setup_completed(&self, connection: ConnectionId);

    /// A block was read. Returns true when the block was queued for writing
    /// on the opposite side, which the reader counts for backpressure.
    fn on_new_message_block(&self, connection: ConnectionId, block: MessageBlock) -> bool;

    /// A block queued on `connection` was written to its peer.
    fn on_message_block_sent(&self, connection: ConnectionId);

    /// The connection wants to be closed (end of stream, error, idle, failed setup).
    fn on_connection_close(&self, connection: ConnectionId);

    /// The connection finished all outstanding operations and is gone.
    fn on_connection_closed(&self, connection: ConnectionId);
}
