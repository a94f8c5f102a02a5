//! Latency accounting for message blocks.
//!
//! ```text
//! receiving  = receive   - receiveStart
//! processing = sendStart - receive
//! sending    = send      - sendStart
//! full       = send      - receive
//! ```

use std::fmt;
use std::time::Duration;

use crate::buffer::block::MessageBlock;

/// Count / min / max / mean over microsecond samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStat {
    count: u64,
    min: u64,
    max: u64,
    sum: u128,
}

impl LatencyStat {
    pub fn add(&mut self, sample: Duration) {
        let micros = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        if self.count == 0 {
            self.min = micros;
            self.max = micros;
        } else {
            self.min = self.min.min(micros);
            self.max = self.max.max(micros);
        }
        self.count += 1;
        self.sum += u128::from(micros);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.min))
    }

    pub fn max(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.max))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum / u128::from(self.count);
        Some(Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    pub fn merge(&mut self, other: &LatencyStat) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sum += other.sum;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for LatencyStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min(), self.mean(), self.max()) {
            (Some(min), Some(mean), Some(max)) => write!(
                f,
                "{}/{}/{} us ({})",
                min.as_micros(),
                mean.as_micros(),
                max.as_micros(),
                self.count
            ),
            _ => write!(f, "-"),
        }
    }
}

/// The four latencies of one traffic direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MessageBlocksLatencyStat {
    pub receiving: LatencyStat,
    pub processing: LatencyStat,
    pub sending: LatencyStat,
    pub full: LatencyStat,
}

impl MessageBlocksLatencyStat {
    /// Account a block; latencies whose timestamps are missing are skipped.
    pub fn accumulate(&mut self, block: &MessageBlock) {
        if let Some(d) = block.receiving_latency() {
            self.receiving.add(d);
        }
        if let Some(d) = block.processing_latency() {
            self.processing.add(d);
        }
        if let Some(d) = block.sending_latency() {
            self.sending.add(d);
        }
        if let Some(d) = block.full_latency() {
            self.full.add(d);
        }
    }

    pub fn merge(&mut self, other: &MessageBlocksLatencyStat) {
        self.receiving.merge(&other.receiving);
        self.processing.merge(&other.processing);
        self.sending.merge(&other.sending);
        self.full.merge(&other.full);
    }

    pub fn is_empty(&self) -> bool {
        self.full.count() == 0 && self.receiving.count() == 0
    }
}

impl fmt::Display for MessageBlocksLatencyStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "receiving {}, processing {}, sending {}, full {}",
            self.receiving, self.processing, self.sending, self.full
        )
    }
}

/// Rolling current / previous / lifetime statistics.
#[derive(Debug, Clone, Default)]
pub struct LatencyPeriods {
    current: MessageBlocksLatencyStat,
    previous: MessageBlocksLatencyStat,
    lifetime: MessageBlocksLatencyStat,
}

impl LatencyPeriods {
    pub fn accumulate(&mut self, block: &MessageBlock) {
        self.current.accumulate(block);
    }

    /// Close the current period: it becomes `previous` and joins `lifetime`.
    pub fn rotate(&mut self) {
        self.lifetime.merge(&self.current);
        self.previous = std::mem::take(&mut self.current);
    }

    pub fn current(&self) -> &MessageBlocksLatencyStat {
        &self.current
    }

    pub fn previous(&self) -> &MessageBlocksLatencyStat {
        &self.previous
    }

    /// Lifetime including the still open period.
    pub fn lifetime(&self) -> MessageBlocksLatencyStat {
        let mut total = self.lifetime;
        total.merge(&self.current);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_stat_has_no_values() {
        let stat = LatencyStat::default();
        assert_eq!(stat.count(), 0);
        assert!(stat.mean().is_none());
        assert_eq!(stat.to_string(), "-");
    }

    #[test]
    fn stat_tracks_min_max_mean() {
        let mut stat = LatencyStat::default();
        for us in [10, 30, 20] {
            stat.add(Duration::from_micros(us));
        }
        assert_eq!(stat.min(), Some(Duration::from_micros(10)));
        assert_eq!(stat.max(), Some(Duration::from_micros(30)));
        assert_eq!(stat.mean(), Some(Duration::from_micros(20)));
    }

    #[test]
    fn rotate_moves_current_into_previous_and_lifetime() {
        let mut periods = LatencyPeriods::default();
        let block = MessageBlock::copy_from(b"abc");
        block.mark_send_start();
        block.mark_sent();
        periods.accumulate(&block);
        periods.rotate();
        assert_eq!(periods.current().full.count(), 0);
        assert_eq!(periods.previous().full.count(), 1);
        periods.accumulate(&block);
        assert_eq!(periods.lifetime().full.count(), 2);
    }

    proptest! {
        #[test]
        fn merge_is_order_independent(samples in proptest::collection::vec(0u64..1_000_000, 1..64), split in 0usize..64) {
            let split = split.min(samples.len());
            let mut whole = LatencyStat::default();
            for s in &samples {
                whole.add(Duration::from_micros(*s));
            }
            let mut left = LatencyStat::default();
            let mut right = LatencyStat::default();
            for s in &samples[..split] {
                left.add(Duration::from_micros(*s));
            }
            for s in samples[split..].iter().rev() {
                right.add(Duration::from_micros(*s));
            }
            right.merge(&left);
            prop_assert_eq!(whole, right);
        }

        #[test]
        fn timestamp_arrival_order_never_panics(order in Just(vec![0u8, 1]).prop_shuffle()) {
            let block = MessageBlock::copy_from(b"p");
            for step in order {
                match step {
                    0 => block.mark_send_start(),
                    _ => block.mark_sent(),
                }
            }
            let mut stat = MessageBlocksLatencyStat::default();
            stat.accumulate(&block);
            prop_assert_eq!(stat.receiving.count(), 1);
            prop_assert_eq!(stat.full.count(), 1);
        }
    }
}
