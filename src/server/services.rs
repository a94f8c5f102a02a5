//! Periodic loops: service work and statistics dumps.

use std::sync::Weak;
use std::time::Duration;

use crate::lifecycle::shutdown::ShutdownListener;
use crate::server::worker::WorkerCore;

/// Call `do_work` on every started service, off the proactor threads.
pub(crate) async fn run(core: Weak<WorkerCore>, interval: Duration, mut shutdown: ShutdownListener) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.stopped() => break,
        }
        let Some(worker) = core.upgrade() else { break };
        let services = worker.active_services();
        drop(worker);
        if services.is_empty() {
            continue;
        }
        let work = tokio::task::spawn_blocking(move || {
            for service in &services {
                service.do_work();
            }
        });
        if let Err(err) = work.await {
            tracing::error!(error = %err, "Services work task failed");
        }
    }
    tracing::debug!("Services loop stopped");
}

pub(crate) async fn dump_stats(core: Weak<WorkerCore>, interval: Duration, mut shutdown: ShutdownListener) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.stopped() => break,
        }
        match core.upgrade() {
            Some(worker) => worker.dump_stats(),
            None => break,
        }
    }
}
