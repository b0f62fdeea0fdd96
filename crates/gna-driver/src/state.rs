//! Shared device state, split into three independent lock domains.
//!
//! | Domain | Guards |
//! |--------|--------|
//! | request | active request, its memory context, timeout flag |
//! | application | session currently bound to the hardware |
//! | power | D0i3 flag; serializes power transitions |
//!
//! Locks are taken briefly. The request lock is the outermost: it may be
//! held while the application, power or a memory context lock is taken,
//! never the reverse. It stays held while a request is started, while a hung
//! one is aborted and while memory under an active request is released.
//! Requests are always completed after every guard has been dropped.

use crate::memory::MemoryContext;
use crate::request::{ScoreRequest, SessionId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A named mutex whose poisoning is recovered rather than propagated.
pub(crate) struct LockDomain<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> LockDomain<T> {
    pub(crate) const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovering poisoned {} lock", self.name);
            PoisonError::into_inner(poisoned)
        })
    }

    /// `None` when another context currently holds the lock
    #[cfg(test)]
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        use std::sync::TryLockError;
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// The request the hardware is working on.
pub(crate) struct ActiveRequest {
    pub request: ScoreRequest,
    pub memory: Arc<MemoryContext>,
    pub stats_level: u32,
    pub started: Instant,
}

#[derive(Default)]
pub(crate) struct RequestState {
    pub active: Option<ActiveRequest>,
    pub timed_out: bool,
}

#[derive(Default)]
pub(crate) struct ApplicationState {
    pub current: Option<SessionId>,
}

#[derive(Default)]
pub(crate) struct PowerState {
    pub d0i3: bool,
}
