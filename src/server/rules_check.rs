//! Retry loop for tunnel rules that did not fully open.
//!
//! A rule lands in the check set when an input failed to open. Each entry
//! carries its own backoff deadline; the loop wakes at least once a second
//! and hands every due rule to the updating thread, which re-reads the
//! entry there so a rule deleted in the meantime is not resurrected.

use std::sync::Weak;
use std::time::{Duration, Instant};

use crate::lifecycle::shutdown::ShutdownListener;
use crate::server::worker::WorkerCore;

const MAX_TICK: Duration = Duration::from_secs(1);

pub(crate) async fn run(core: Weak<WorkerCore>, interval: Duration, mut shutdown: ShutdownListener) {
    let mut ticker = tokio::time::interval(interval.min(MAX_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(interval_secs = interval.as_secs(), "Rules check loop started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.stopped() => break,
        }
        let Some(worker) = core.upgrade() else { break };
        let due = worker.due_rechecks(Instant::now());
        drop(worker);
        for uuid in due {
            let core = core.clone();
            let checked = tokio::task::spawn_blocking(move || {
                if let Some(worker) = core.upgrade() {
                    worker.run_recheck(uuid);
                }
            });
            tokio::select! {
                result = checked => {
                    if let Err(err) = result {
                        tracing::error!(rule = %uuid, error = %err, "Rule check task failed");
                    }
                }
                _ = shutdown.stopped() => {
                    tracing::debug!("Rules check loop stopped");
                    return;
                }
            }
        }
    }
    tracing::debug!("Rules check loop stopped");
}
