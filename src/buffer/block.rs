//! Shared message block with its timing satellite.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::buffer::pool::Generation;

/// Timing record carried by every block.
#[derive(Debug, Default)]
pub struct Satellite {
    receive_start: OnceLock<Instant>,
    receive: OnceLock<Instant>,
    send_start: OnceLock<Instant>,
    send: OnceLock<Instant>,
}

impl Satellite {
    pub fn receive_start(&self) -> Option<Instant> {
        self.receive_start.get().copied()
    }

    pub fn receive(&self) -> Option<Instant> {
        self.receive.get().copied()
    }

    pub fn send_start(&self) -> Option<Instant> {
        self.send_start.get().copied()
    }

    pub fn send(&self) -> Option<Instant> {
        self.send.get().copied()
    }
}

struct Shared {
    payload: BytesMut,
    origin: Option<Arc<Generation>>,
    satellite: Satellite,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(origin) = self.origin.take() {
            origin.release(std::mem::take(&mut self.payload));
        }
    }
}

/// A received chunk of payload.
///
/// Cloning through [`MessageBlock::duplicate`] shares the payload; the block
/// goes back to its pool when the last handle is dropped.
pub struct MessageBlock {
    shared: Arc<Shared>,
}

impl MessageBlock {
    pub(crate) fn from_parts(
        payload: BytesMut,
        origin: Option<Arc<Generation>>,
        receive_start: Option<Instant>,
    ) -> Self {
        let satellite = Satellite::default();
        let now = Instant::now();
        let _ = satellite.receive_start.set(receive_start.unwrap_or(now));
        let _ = satellite.receive.set(now);
        Self {
            shared: Arc::new(Shared {
                payload,
                origin,
                satellite,
            }),
        }
    }

    /// Block that does not belong to any pool.
    pub fn copy_from(data: &[u8]) -> Self {
        Self::from_parts(BytesMut::from(data), None, None)
    }

    pub fn data(&self) -> &[u8] {
        &self.shared.payload
    }

    pub fn len(&self) -> usize {
        self.shared.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.payload.is_empty()
    }

    /// Second owning handle to the same payload.
    pub fn duplicate(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of live handles, the satellite reference count.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn satellite(&self) -> &Satellite {
        &self.shared.satellite
    }

    /// First call wins; duplicates share one satellite.
    pub fn mark_send_start(&self) {
        let _ = self.shared.satellite.send_start.set(Instant::now());
    }

    pub fn mark_sent(&self) {
        let _ = self.shared.satellite.send.set(Instant::now());
    }

    /// Time of the last activity recorded on this block.
    pub fn last_activity(&self) -> Option<Instant> {
        let s = &self.shared.satellite;
        s.send().or_else(|| s.send_start()).or_else(|| s.receive())
    }

    pub fn receiving_latency(&self) -> Option<Duration> {
        let s = &self.shared.satellite;
        Some(s.receive()?.saturating_duration_since(s.receive_start()?))
    }

    pub fn processing_latency(&self) -> Option<Duration> {
        let s = &self.shared.satellite;
        Some(s.send_start()?.saturating_duration_since(s.receive()?))
    }

    pub fn sending_latency(&self) -> Option<Duration> {
        let s = &self.shared.satellite;
        Some(s.send()?.saturating_duration_since(s.send_start()?))
    }

    pub fn full_latency(&self) -> Option<Duration> {
        let s = &self.shared.satellite;
        Some(s.send()?.saturating_duration_since(s.receive()?))
    }

    pub(crate) fn generation(&self) -> Option<Arc<Generation>> {
        self.shared.origin.clone()
    }
}

impl fmt::Debug for MessageBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBlock")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .field("pooled", &self.shared.origin.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::{MessagePool, PoolConfig};

    fn pool() -> MessagePool {
        MessagePool::new(PoolConfig {
            block_size: 32,
            block_count: 1,
            max_block_count: 1,
        })
    }

    #[test]
    fn duplicate_shares_payload_without_copy() {
        let pool = pool();
        let block = pool.allocate_with(b"hello").unwrap();
        let dup = block.duplicate();
        assert_eq!(block.ref_count(), 2);
        assert_eq!(dup.data().as_ptr(), block.data().as_ptr());
    }

    #[test]
    fn duplicate_then_two_releases_frees_once() {
        let pool = pool();
        let block = pool.allocate_with(b"payload").unwrap();
        let generation = block.generation().unwrap();
        let dup = block.duplicate();

        drop(block);
        assert_eq!(generation.outstanding(), 1);
        assert_eq!(dup.data(), b"payload");

        drop(dup);
        assert_eq!(generation.outstanding(), 0);

        // The single slot is reusable, so it was returned exactly once.
        let again = pool.allocate(8).unwrap();
        assert!(again.is_pooled());
        drop(again);
        assert_eq!(generation.outstanding(), 0);
    }

    #[test]
    fn latencies_follow_timestamps() {
        let block = MessageBlock::copy_from(b"x");
        assert!(block.receiving_latency().is_some());
        assert!(block.full_latency().is_none());
        block.mark_send_start();
        block.mark_sent();
        let full = block.full_latency().unwrap();
        let processing = block.processing_latency().unwrap();
        let sending = block.sending_latency().unwrap();
        assert!(full >= processing);
        assert!(full >= sending);
    }
}
