//! Recovery timer on a background thread.

use crate::platform::{TimerCallback, TimerService};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Pending {
    deadline: Instant,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerState {
    pending: Option<Pending>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// [`TimerService`] backed by one sleeping worker thread.
///
/// The callback runs on the worker with no timer lock held, so it may
/// re-arm or cancel the timer.
pub struct ThreadTimer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTimer").finish_non_exhaustive()
    }
}

impl ThreadTimer {
    /// Spawn the timer thread
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("gna-recovery-timer".into())
            .spawn(move || run(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.shutdown {
            return;
        }
        let Some(deadline) = state.pending.as_ref().map(|p| p.deadline) else {
            state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        let now = Instant::now();
        if now < deadline {
            state = shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }
        if let Some(expired) = state.pending.take() {
            drop(state);
            tracing::debug!("Recovery timer expired");
            (expired.callback)();
            state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl TimerService for ThreadTimer {
    fn arm(&self, timeout: Duration, on_expiry: TimerCallback) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending = Some(Pending {
            deadline: Instant::now() + timeout,
            callback: on_expiry,
        });
        self.shared.wake.notify_one();
    }

    fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let was_pending = state.pending.take().is_some();
        self.shared.wake.notify_one();
        was_pending
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.shutdown = true;
            state.pending = None;
        }
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            // The last device reference may be dropped from inside a callback.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
