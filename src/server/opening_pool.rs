//! Elastic thread pool for tunnel opening, switching and teardown.
//!
//! # Responsibilities
//! - Run blocking jobs off the proactor threads
//! - Grow while more jobs wait than threads are idle, up to the maximum
//! - Let surplus threads exit after an idle period, down to the minimum
//! - Catch job panics and keep serving
//!
//! # Design Decisions
//! - Workers block on a crossbeam channel with a bounded idle wait
//! - A new thread counts as idle until it takes its first job

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run { label: String, job: Job },
    Exit,
}

/// Sizing of the opening pool.
#[derive(Debug, Clone, Copy)]
pub struct OpeningPoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Duration,
}

impl Default for OpeningPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 4,
            max_threads: 600,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    config: OpeningPoolConfig,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    threads: AtomicUsize,
    idle: AtomicUsize,
    stopped: AtomicBool,
    spawned: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Pool of opening threads.
pub struct OpeningPool {
    shared: Arc<Shared>,
}

impl OpeningPool {
    pub fn new(config: OpeningPoolConfig) -> Result<Self> {
        let min_threads = config.min_threads.max(1);
        let config = OpeningPoolConfig {
            min_threads,
            max_threads: config.max_threads.max(min_threads),
            idle_timeout: config.idle_timeout,
        };
        let (tx, rx) = channel::unbounded();
        let pool = Self {
            shared: Arc::new(Shared {
                config,
                tx,
                rx,
                threads: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                spawned: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        };
        for _ in 0..config.min_threads {
            pool.spawn_thread()?;
        }
        tracing::debug!(
            min = config.min_threads,
            max = config.max_threads,
            "Tunnel opening pool started"
        );
        Ok(pool)
    }

    /// Threads currently alive.
    pub fn threads(&self) -> usize {
        self.shared.threads.load(Ordering::Acquire)
    }

    /// Jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.rx.len()
    }

    /// Queue a job. `label` names it in panic reports.
    pub fn submit<F>(&self, label: impl Into<String>, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::Logical("tunnel opening pool is stopped".into()));
        }
        self.shared
            .tx
            .send(Task::Run {
                label: label.into(),
                job: Box::new(job),
            })
            .map_err(|_| Error::Logical("tunnel opening pool is stopped".into()))?;
        self.grow_if_needed();
        Ok(())
    }

    fn grow_if_needed(&self) {
        let shared = &self.shared;
        while shared.rx.len() > shared.idle.load(Ordering::Acquire) {
            let threads = shared.threads.load(Ordering::Acquire);
            if threads >= shared.config.max_threads {
                tracing::warn!(threads, "Tunnel opening pool is at its maximum size");
                return;
            }
            if let Err(err) = self.spawn_thread() {
                tracing::error!(error = %err, "Failed to start tunnel opening thread");
                return;
            }
            tracing::debug!(threads = threads + 1, "Started one more tunnel opening thread");
        }
    }

    fn spawn_thread(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        shared.threads.fetch_add(1, Ordering::AcqRel);
        shared.idle.fetch_add(1, Ordering::AcqRel);
        let number = shared.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("tunnelex-opening-{number}"))
            .spawn(move || worker_loop(worker));
        match spawned {
            Ok(handle) => {
                let mut handles = shared.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(err) => {
                shared.threads.fetch_sub(1, Ordering::AcqRel);
                shared.idle.fetch_sub(1, Ordering::AcqRel);
                Err(Error::system("spawning tunnel opening thread", err))
            }
        }
    }

    /// Ask every thread to exit after the jobs queued so far and wait for
    /// them.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = self.threads();
        for _ in 0..threads {
            let _ = self.shared.tx.send(Task::Exit);
        }
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Tunnel opening thread panicked");
            }
        }
        tracing::debug!("Tunnel opening pool stopped");
    }
}

impl Drop for OpeningPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for OpeningPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpeningPool")
            .field("threads", &self.threads())
            .field("idle", &self.shared.idle.load(Ordering::Relaxed))
            .field("queued", &self.queued())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::trace!("Tunnel opening thread started");
    loop {
        let task = match shared.rx.recv_timeout(shared.config.idle_timeout) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => {
                if leave_if_surplus(&shared) {
                    tracing::debug!("Idle tunnel opening thread exits");
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match task {
            Task::Exit => break,
            Task::Run { label, job } => {
                shared.idle.fetch_sub(1, Ordering::AcqRel);
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(job = %label, "Tunnel opening job panicked");
                }
                shared.idle.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    shared.idle.fetch_sub(1, Ordering::AcqRel);
    shared.threads.fetch_sub(1, Ordering::AcqRel);
}

fn leave_if_surplus(shared: &Shared) -> bool {
    let mut threads = shared.threads.load(Ordering::Acquire);
    loop {
        if threads <= shared.config.min_threads {
            return false;
        }
        match shared.threads.compare_exchange(
            threads,
            threads - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                shared.idle.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
            Err(actual) => threads = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn blocked_jobs(pool: &OpeningPool, count: usize) -> (Vec<mpsc::Sender<()>>, mpsc::Receiver<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let mut releases = Vec::new();
        for i in 0..count {
            let (release_tx, release_rx) = mpsc::channel::<()>();
            releases.push(release_tx);
            let started = started_tx.clone();
            pool.submit(format!("blocked-{i}"), move || {
                let _ = started.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        }
        (releases, started_rx)
    }

    #[test]
    fn grows_to_queue_length_when_all_threads_block() {
        let pool = OpeningPool::new(OpeningPoolConfig {
            min_threads: 2,
            max_threads: 16,
            idle_timeout: Duration::from_secs(30),
        })
        .unwrap();
        let (releases, started) = blocked_jobs(&pool, 7);
        for _ in 0..7 {
            started.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.threads(), 7);
        drop(releases);
        pool.stop();
    }

    #[test]
    fn never_exceeds_maximum() {
        let pool = OpeningPool::new(OpeningPoolConfig {
            min_threads: 1,
            max_threads: 3,
            idle_timeout: Duration::from_secs(30),
        })
        .unwrap();
        let (releases, started) = blocked_jobs(&pool, 6);
        for _ in 0..3 {
            started.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(started.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(pool.threads(), 3);
        assert_eq!(pool.queued(), 3);
        drop(releases);
        for _ in 0..3 {
            started.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.stop();
    }

    #[test]
    fn surplus_threads_exit_after_idle_period() {
        let pool = OpeningPool::new(OpeningPoolConfig {
            min_threads: 1,
            max_threads: 8,
            idle_timeout: Duration::from_millis(100),
        })
        .unwrap();
        let (releases, started) = blocked_jobs(&pool, 4);
        for _ in 0..4 {
            started.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.threads(), 4);
        drop(releases);
        assert!(wait_until(Duration::from_secs(5), || pool.threads() == 1));
        pool.stop();
    }

    #[test]
    fn panicking_job_does_not_stop_serving() {
        let pool = OpeningPool::new(OpeningPoolConfig {
            min_threads: 1,
            max_threads: 1,
            idle_timeout: Duration::from_secs(30),
        })
        .unwrap();
        pool.submit("panics", || panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit("after", move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(pool.threads(), 1);
        pool.stop();
        assert!(pool.submit("late", || {}).is_err());
    }
}
