//! Scoring requests and their completion.
//!
//! A [`ScoreRequest`] is owned by exactly one place at a time (the queue,
//! the active slot, or the completion funnel) and completing it consumes
//! it, so a request cannot be completed twice. A request dropped without
//! an explicit completion is completed as cancelled, so it is never lost.

use crate::error::GnaError;
use crate::hw::HardwareStatus;
use crate::memory::MemoryId;
use crate::session::Session;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Session identifier
pub type SessionId = u64;

/// Request identifier, unique per device
pub type RequestId = u64;

/// Final status of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// The hardware reached a terminal state
    Hardware(HardwareStatus),
    /// Cancelled before completion
    Cancelled,
    /// Rejected or failed before the hardware produced a result
    Failed(GnaError),
    /// Memory notification: the given context was unmapped
    MemoryReleased(MemoryId),
}

impl RequestStatus {
    /// `true` for `Success`, `Saturated` and memory notifications
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Hardware(HardwareStatus::Success | HardwareStatus::Saturated)
                | Self::MemoryReleased(_)
        )
    }
}

/// Hardware cycle counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwarePerf {
    /// Total scoring cycles (`PTC`)
    pub total_cycles: u32,
    /// Cycles stalled on memory (`PSC`)
    pub stall_cycles: u32,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreReport {
    /// Final status
    pub status: RequestStatus,
    /// Cycle counters, when statistics were requested
    pub perf: Option<HardwarePerf>,
    /// Submission to completion
    pub driver_time: Duration,
}

#[derive(Default)]
struct CompletionSlot {
    done: AtomicBool,
    report: Mutex<Option<ScoreReport>>,
    ready: Condvar,
}

impl CompletionSlot {
    fn fill(&self, report: ScoreReport) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
        self.ready.notify_all();
        true
    }
}

/// A submitted request on its way through the driver.
pub struct ScoreRequest {
    id: RequestId,
    session: Arc<Session>,
    payload: Bytes,
    submitted: Instant,
    slot: Arc<CompletionSlot>,
}

impl std::fmt::Debug for ScoreRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreRequest")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl ScoreRequest {
    pub(crate) fn new(id: RequestId, session: Arc<Session>, payload: Bytes) -> (Self, RequestHandle) {
        let slot = Arc::new(CompletionSlot::default());
        let handle = RequestHandle {
            id,
            slot: Arc::clone(&slot),
        };
        let request = Self {
            id,
            session,
            payload,
            submitted: Instant::now(),
            slot,
        };
        (request, handle)
    }

    /// Request identifier
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Owning session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Owning session id
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Raw request buffer
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Complete with `status` and optional counters.
    pub fn complete(self, status: RequestStatus, perf: Option<HardwarePerf>) {
        let report = ScoreReport {
            status,
            perf,
            driver_time: self.submitted.elapsed(),
        };
        tracing::debug!("Request {} completed: {:?}", self.id, report.status);
        self.slot.fill(report);
    }
}

impl Drop for ScoreRequest {
    fn drop(&mut self) {
        if !self.slot.done.load(Ordering::Acquire) {
            tracing::warn!("Request {} dropped without completion, cancelling", self.id);
            self.slot.fill(ScoreReport {
                status: RequestStatus::Cancelled,
                perf: None,
                driver_time: self.submitted.elapsed(),
            });
        }
    }
}

/// Caller's side of a request: wait for the single completion.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    slot: Arc<CompletionSlot>,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl RequestHandle {
    /// Request identifier
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// `true` once the request has been completed
    pub fn is_complete(&self) -> bool {
        self.try_report().is_some()
    }

    /// The report, if the request has completed
    pub fn try_report(&self) -> Option<ScoreReport> {
        self.slot
            .report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the request completes
    pub fn wait(&self) -> ScoreReport {
        let mut report = self.slot.report.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(done) = report.as_ref() {
                return done.clone();
            }
            report = self
                .slot
                .ready
                .wait(report)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the request completes or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ScoreReport> {
        let deadline = Instant::now() + timeout;
        let mut report = self.slot.report.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(done) = report.as_ref() {
                return Some(done.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            report = self
                .slot
                .ready
                .wait_timeout(report, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
