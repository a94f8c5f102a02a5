//! Spin lock with a pluggable backoff.
//!
//! There is one lock type; the relax strategy is its only knob. `Aggressive`
//! busy-spins with a CPU hint, `Tolerant` yields the thread between attempts.

use spin::relax::RelaxStrategy;

/// Busy-spin with `core::hint::spin_loop`.
pub type Aggressive = spin::relax::Spin;

/// Yield to the OS scheduler between lock attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tolerant;

impl RelaxStrategy for Tolerant {
    #[inline(always)]
    fn relax() {
        std::thread::yield_now();
    }
}

/// Spin mutex used by the buffer pools.
pub type SpinLock<T, R = Aggressive> = spin::mutex::SpinMutex<T, R>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tolerant_lock_serializes_writers() {
        let counter: Arc<SpinLock<u64, Tolerant>> = Arc::new(SpinLock::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
