//! The rule-updating thread.
//!
//! # Data Flow
//! ```text
//! caller ─ wait(turn) ─→ request slot ─ notify(request) ─→ updating thread
//!                                                              │ apply
//! caller ←─ wait(response) ── response slot ←──────────────────┘
//! ```
//!
//! Each call draws a ticket and waits for its turn, so callers are applied one
//! at a time in the order they called.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

struct Slots<Req, Resp> {
    request: Option<Req>,
    response: Option<Resp>,
    stopped: bool,
    next_ticket: u64,
    serving: u64,
}

struct Shared<Req, Resp> {
    slots: Mutex<Slots<Req, Resp>>,
    turn: Condvar,
    request_ready: Condvar,
    response_ready: Condvar,
}

/// A dedicated thread applying requests one at a time.
pub struct Updater<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<Req, Resp> Updater<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn start<F>(name: &str, apply: F) -> Result<Self>
    where
        F: FnMut(Req) -> Resp + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots {
                request: None,
                response: None,
                stopped: false,
                next_ticket: 0,
                serving: 0,
            }),
            turn: Condvar::new(),
            request_ready: Condvar::new(),
            response_ready: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || updating_loop(worker, apply))
            .map_err(|err| Error::system("spawning updating thread", err))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Apply `request` on the updating thread and wait for its result.
    pub fn call(&self, request: Req) -> Result<Resp> {
        let mut slots = self.shared.slots.lock();
        let ticket = slots.next_ticket;
        slots.next_ticket += 1;
        while slots.serving != ticket && !slots.stopped {
            self.shared.turn.wait(&mut slots);
        }
        if slots.stopped {
            return Err(Error::Logical("server worker is stopping".into()));
        }
        slots.request = Some(request);
        self.shared.request_ready.notify_one();
        let outcome = loop {
            if let Some(response) = slots.response.take() {
                break Ok(response);
            }
            if slots.stopped && slots.request.is_some() {
                slots.request = None;
                break Err(Error::Logical("server worker is stopping".into()));
            }
            self.shared.response_ready.wait(&mut slots);
        };
        slots.serving += 1;
        self.shared.turn.notify_all();
        outcome
    }

    /// Calls in progress or waiting for their turn.
    pub fn pending_calls(&self) -> u64 {
        let slots = self.shared.slots.lock();
        slots.next_ticket - slots.serving
    }

    /// Let the current request finish, then end the thread.
    pub fn stop(&self) {
        {
            let mut slots = self.shared.slots.lock();
            slots.stopped = true;
        }
        self.shared.turn.notify_all();
        self.shared.request_ready.notify_all();
        self.shared.response_ready.notify_all();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::error!("Updating thread panicked");
            }
        }
    }
}

impl<Req, Resp> Drop for Updater<Req, Resp> {
    fn drop(&mut self) {
        self.shared.slots.lock().stopped = true;
        self.shared.turn.notify_all();
        self.shared.request_ready.notify_all();
        self.shared.response_ready.notify_all();
    }
}

impl<Req, Resp> fmt::Debug for Updater<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updater")
            .field("stopped", &self.shared.slots.lock().stopped)
            .finish()
    }
}

fn updating_loop<Req, Resp, F>(shared: Arc<Shared<Req, Resp>>, mut apply: F)
where
    F: FnMut(Req) -> Resp,
{
    tracing::debug!("Updating thread started");
    loop {
        let request = {
            let mut slots = shared.slots.lock();
            loop {
                if let Some(request) = slots.request.take() {
                    break request;
                }
                if slots.stopped {
                    tracing::debug!("Updating thread completed");
                    return;
                }
                shared.request_ready.wait(&mut slots);
            }
        };
        let response = apply(request);
        shared.slots.lock().response = Some(response);
        shared.response_ready.notify_all();
    }
}
