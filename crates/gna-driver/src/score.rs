//! Score processor: the scoring request state machine.
//!
//! ```text
//!          dispatch                 interrupt / timeout
//!  Idle ─────────────▶ Armed ──────────────────────────▶ Completed ─▶ Idle
//!    ▲  validation        │  timeout with START asserted
//!    └──── failure ◀──────┤
//!                         └─▶ Aborting ─▶ Failed (DeviceFailure) ─▶ Idle
//! ```
//!
//! The active slot is taken under the request lock, so when the interrupt
//! and the timeout race only one of them finds a request to complete. The
//! recovery timer is armed for one request and does nothing once a later
//! one holds the slot. Interrupts count only while the hardware is
//! interruptible, between a start and the completion of that request.

use crate::config::DriverConfig;
use crate::error::{GnaError, Result};
use crate::hw::{ExecutionConfig, HardwareControl, HardwareStatus};
use crate::layout;
use crate::memory::{write_u32, MemoryContext};
use crate::platform::TimerService;
use crate::queue::RequestQueue;
use crate::request::{RequestId, RequestStatus, ScoreRequest, SessionId};
use crate::state::{ActiveRequest, ApplicationState, LockDomain, RequestState};
use gna_chip::descriptor::{xnn, XNN_CONFIG_OFFSET};
use gna_chip::regs::control;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of servicing an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// No active request, or another context completed it first
    Spurious,
    /// Hardware still busy; the request stays active
    MoreProcessingRequired,
    /// The active request was completed with this status
    Completed(HardwareStatus),
}

/// Result of the recovery timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Nothing was active
    Idle,
    /// The hardware had already finished; the interrupt path owns completion
    AlreadyCompleted,
    /// The hardware was aborted and the request completed with this status
    Recovered(HardwareStatus),
}

/// Drives scoring requests through the hardware one at a time.
pub struct ScoreProcessor {
    hw: HardwareControl,
    request: LockDomain<RequestState>,
    application: LockDomain<ApplicationState>,
    queue: RequestQueue,
    timer: Arc<dyn TimerService>,
    score_timeout: Duration,
    preserve_registers: bool,
    accepting: AtomicBool,
    dispatching: AtomicBool,
    this: Weak<ScoreProcessor>,
}

impl std::fmt::Debug for ScoreProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreProcessor")
            .field("hw", &self.hw)
            .field("active", &self.active_request())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl ScoreProcessor {
    pub(crate) fn new(hw: HardwareControl, timer: Arc<dyn TimerService>, config: &DriverConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            hw,
            request: LockDomain::new("request", RequestState::default()),
            application: LockDomain::new("application", ApplicationState::default()),
            queue: RequestQueue::new(),
            timer,
            score_timeout: config.score_timeout,
            preserve_registers: config.preserve_registers,
            accepting: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Hardware control
    pub const fn hardware(&self) -> &HardwareControl {
        &self.hw
    }

    /// Waiting requests
    pub const fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Identifier of the request the hardware is working on
    pub fn active_request(&self) -> Option<RequestId> {
        self.request.lock().active.as_ref().map(|a| a.request.id())
    }

    /// Session currently bound to the hardware
    pub fn current_application(&self) -> Option<SessionId> {
        self.application.lock().current
    }

    /// `true` between power entry and power exit
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Queue `request` and start it if the hardware is free.
    pub fn submit(&self, request: ScoreRequest) {
        debug!("Queued request {} for session {}", request.id(), request.session_id());
        self.queue.push_back(request);
        self.pump();
    }

    /// Start queued requests while the active slot is free. When nothing is
    /// left to run, put the device to sleep.
    pub fn pump(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            while self.active_request().is_none() {
                let Some(next) = self.queue.pop_front() else {
                    break;
                };
                self.dispatch(next);
            }
            if !self.preserve_registers && self.active_request().is_none() && self.queue.is_idle() {
                if let Err(e) = self.hw.power_transition(true) {
                    warn!("Could not enter D0i3: {e}");
                }
            }
            self.dispatching.store(false, Ordering::Release);

            if self.active_request().is_some() || self.queue.is_idle() {
                return;
            }
        }
    }

    fn dispatch(&self, request: ScoreRequest) {
        let id = request.id();
        let session = request.session_id();

        if !self.is_accepting() {
            request.complete(RequestStatus::Failed(GnaError::DeviceRemoved), None);
            return;
        }
        if request.session().is_closed() {
            request.complete(RequestStatus::Cancelled, None);
            return;
        }

        let (memory, exec) = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Request {id} rejected: {e}");
                request.complete(RequestStatus::Failed(e), None);
                return;
            }
        };

        let descriptor = memory.descriptor_address();
        // Published and started under the request lock. A concurrent unmap
        // or session close either finds this request active or has already
        // released its memory.
        let mut state = self.request.lock();
        if memory.is_released() {
            drop(state);
            warn!("Memory {} of request {id} was released before start", memory.id());
            request.complete(RequestStatus::Cancelled, None);
            return;
        }
        self.application.lock().current = Some(session);
        state.timed_out = false;
        state.active = Some(ActiveRequest {
            request,
            memory,
            stats_level: exec.stats_level,
            started: Instant::now(),
        });
        self.arm_timer(id);
        let started = self.hw.start_execution(descriptor, exec);
        drop(state);

        if let Err(e) = started {
            error!("Request {id} could not start: {e}");
            self.complete_request(RequestStatus::Failed(e), None, true, None);
            return;
        }
        debug!("Request {id} armed");
    }

    /// Parse, resolve and patch. Nothing touches the hardware here.
    fn prepare(&self, request: &ScoreRequest) -> Result<(Arc<MemoryContext>, ExecutionConfig)> {
        let parsed = layout::parse(request.payload())?;
        let header = parsed.header;

        let memory = request
            .session()
            .memory(header.memory_id)
            .ok_or(GnaError::NotMapped {
                id: header.memory_id,
            })?;
        parsed.validate_against(memory.user_size())?;

        memory.program(|view| {
            // Keyed on the memory context alone: a second session reusing a
            // configuration id on the same context gets the first one's overrides.
            if *view.applied_config == Some(header.config_id) {
                debug!("Configuration {} already applied", header.config_id);
            } else {
                parsed.apply_overrides(view.user);
                *view.applied_config = Some(header.config_id);
            }
            parsed.apply_patches(view.user);

            let xnn_block = &mut view.descriptor[XNN_CONFIG_OFFSET..];
            write_u32(xnn_block, xnn::LAYER_BASE, header.layer_base);
            write_u32(xnn_block, xnn::LAYER_COUNT, header.layer_count);
            write_u32(xnn_block, xnn::OP_MODE, parsed.mode.raw());
            write_u32(xnn_block, xnn::ACTIVE_LIST, u32::from(parsed.active_list));
            Ok(())
        })?;

        Ok((
            memory,
            ExecutionConfig {
                op_mode: parsed.mode.raw(),
                active_list: parsed.active_list,
                stats_level: parsed.stats_level,
            },
        ))
    }

    fn arm_timer(&self, armed: RequestId) {
        let this = self.this.clone();
        self.timer.arm(
            self.score_timeout,
            Box::new(move || {
                if let Some(processor) = this.upgrade() {
                    processor.recover(armed);
                }
            }),
        );
    }

    /// Service a completion interrupt.
    ///
    /// Outside the window between a start and its completion the interrupt
    /// cannot belong to the active request and is spurious.
    pub fn on_interrupt(&self) -> InterruptOutcome {
        if !self.hw.is_interruptible() || self.active_request().is_none() {
            debug!("Spurious interrupt");
            return InterruptOutcome::Spurious;
        }

        let status = self.hw.status(&self.request);
        if status.is_busy() {
            // The recovery timer stays armed until the request completes.
            return InterruptOutcome::MoreProcessingRequired;
        }

        if self.complete_request(RequestStatus::Hardware(status), None, true, None) {
            InterruptOutcome::Completed(status)
        } else {
            InterruptOutcome::Spurious
        }
    }

    /// Recover the active request if the hardware never finished it.
    pub fn on_timeout(&self) -> TimeoutOutcome {
        match self.active_request() {
            Some(id) => self.recover(id),
            None => TimeoutOutcome::Idle,
        }
    }

    /// Timer expiry for request `armed`. Checked and aborted under the
    /// request lock, so neither a completion nor the next dispatch can
    /// happen between the check and the abort.
    fn recover(&self, armed: RequestId) -> TimeoutOutcome {
        let (active, status) = {
            let mut state = self.request.lock();
            match state.active.as_ref().map(|a| a.request.id()) {
                None => return TimeoutOutcome::Idle,
                Some(id) if id != armed => {
                    debug!("Timer of request {armed} expired while request {id} runs");
                    return TimeoutOutcome::AlreadyCompleted;
                }
                Some(_) => {}
            }
            if self.hw.control() & control::START == 0 {
                debug!("Timeout for request {armed} raced with completion");
                return TimeoutOutcome::AlreadyCompleted;
            }

            error!("Request {armed} timed out with START asserted, aborting device");
            self.hw.abort();
            state.timed_out = true;
            let status = self.hw.decode_status(|| std::mem::take(&mut state.timed_out));
            state.timed_out = false;
            (state.active.take(), status)
        };

        if let Some(active) = active {
            self.retire(active, RequestStatus::Hardware(status), true);
        }
        TimeoutOutcome::Recovered(status)
    }

    /// Complete every queued request of `session` as cancelled.
    pub fn cancel_by_application(&self, session: SessionId) -> usize {
        let mut cancelled = 0;
        while let Some(request) = self.queue.retrieve_next_for(session) {
            request.complete(RequestStatus::Cancelled, None);
            cancelled += 1;
        }
        if cancelled > 0 {
            info!("Cancelled {cancelled} queued request(s) of session {session}");
        }
        cancelled
    }

    /// Release `contexts` of `session`, cancelling and aborting the active
    /// request first if it runs against one of them. Returns `true` if a
    /// request was cancelled.
    ///
    /// Holds the request lock across the release, so a dispatch racing
    /// with it either is cancelled here or sees the memory released.
    pub(crate) fn release_memory(&self, session: SessionId, contexts: &[Arc<MemoryContext>]) -> bool {
        let cancelled = {
            let mut state = self.request.lock();
            let uses_released = state.active.as_ref().is_some_and(|a| {
                a.request.session_id() == session
                    && contexts.iter().any(|c| Arc::ptr_eq(c, &a.memory))
            });
            let taken = if uses_released {
                state.timed_out = false;
                state.active.take()
            } else {
                None
            };
            if taken.is_some() {
                self.hw.abort();
            }
            for context in contexts {
                context.release();
            }
            taken
        };
        let Some(active) = cancelled else {
            return false;
        };
        self.retire(active, RequestStatus::Cancelled, true);
        true
    }

    /// The single completion funnel.
    ///
    /// With `cancel_only_if` set, nothing happens unless that session is the
    /// one bound to the hardware and owns the active request. An `explicit`
    /// request (one that never became active) is completed as is; otherwise
    /// the active request is taken out of its slot and completed.
    /// `release_hardware` unbinds the session and lets the device sleep or
    /// move on to the next queued request. Returns `true` if a request was
    /// completed.
    pub fn complete_request(
        &self,
        status: RequestStatus,
        explicit: Option<ScoreRequest>,
        release_hardware: bool,
        cancel_only_if: Option<SessionId>,
    ) -> bool {
        if let Some(explicit) = explicit {
            explicit.complete(status, None);
            return true;
        }
        if let Some(owner) = cancel_only_if {
            if self.current_application() != Some(owner) {
                return false;
            }
        }
        self.finish_active(status, release_hardware, |a| {
            cancel_only_if.is_none_or(|owner| a.request.session_id() == owner)
        })
    }

    fn finish_active(
        &self,
        status: RequestStatus,
        release_hardware: bool,
        owns: impl FnOnce(&ActiveRequest) -> bool,
    ) -> bool {
        let taken = {
            let mut state = self.request.lock();
            if state.active.as_ref().is_some_and(owns) {
                state.timed_out = false;
                state.active.take()
            } else {
                None
            }
        };
        let Some(active) = taken else {
            return false;
        };
        if status == RequestStatus::Cancelled {
            self.hw.abort();
        }
        self.retire(active, status, release_hardware);
        true
    }

    /// Complete a request already taken out of the active slot.
    fn retire(&self, active: ActiveRequest, status: RequestStatus, release_hardware: bool) {
        self.hw.set_interruptible(false);
        self.timer.cancel();
        if release_hardware {
            let mut application = self.application.lock();
            if application.current == Some(active.request.session_id()) {
                application.current = None;
            }
        }

        let perf = (active.stats_level > 0 && matches!(status, RequestStatus::Hardware(_)))
            .then(|| self.hw.perf());
        debug!(
            "Request {} finished after {:?}",
            active.request.id(),
            active.started.elapsed()
        );
        active.request.complete(status, perf);

        if release_hardware {
            self.pump();
        }
    }

    /// Cancel the active request and everything queued, then stop the
    /// hardware. Used when the device leaves D0.
    pub(crate) fn shut_down(&self) {
        self.set_accepting(false);
        for request in self.queue.purge() {
            request.complete(RequestStatus::Cancelled, None);
        }
        self.complete_request(RequestStatus::Cancelled, None, true, None);
        self.timer.cancel();
        if let Err(e) = self.hw.power_transition(true) {
            warn!("Could not enter D0i3 on power exit: {e}");
        }
    }
}
