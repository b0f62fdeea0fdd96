//! Device context: the surface the request-dispatch layer talks to.
//!
//! Sessions are explicit handles. Every operation takes the session it acts
//! for, so nothing is looked up from ambient per-handle storage.
//!
//! ```text
//! open_session ─▶ map ─▶ submit ─▶ (on_interrupt | on_timeout) ─▶ unmap ─▶ close_session
//! ```

use crate::capabilities::Capabilities;
use crate::config::DriverConfig;
use crate::error::{GnaError, Result};
use crate::hw::HardwareControl;
use crate::memory::{validate_map_request, MemoryContext, MemoryId};
use crate::mmio::RegisterInterface;
use crate::platform::{DmaPlatform, TimerService};
use crate::request::{RequestHandle, RequestStatus, ScoreRequest};
use crate::score::{InterruptOutcome, ScoreProcessor, TimeoutOutcome};
use crate::session::Session;
use bytes::Bytes;
use gna_chip::bar::{self, bar0};
use gna_chip::regs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// One GNA device instance.
pub struct Device {
    processor: Arc<ScoreProcessor>,
    platform: Arc<dyn DmaPlatform>,
    config: DriverConfig,
    capabilities: OnceLock<Capabilities>,
    next_session: AtomicU64,
    next_request: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("capabilities", &self.capabilities.get())
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Assemble a device from its collaborators. Call
    /// [`prepare_hardware`](Self::prepare_hardware) and
    /// [`on_power_entry`](Self::on_power_entry) before submitting work.
    pub fn new(
        regs: Arc<dyn RegisterInterface>,
        platform: Arc<dyn DmaPlatform>,
        timer: Arc<dyn TimerService>,
        config: DriverConfig,
    ) -> Self {
        let hw = HardwareControl::new(regs, config.poll);
        Self {
            processor: ScoreProcessor::new(hw, timer, &config),
            platform,
            config,
            capabilities: OnceLock::new(),
            next_session: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// Check the register window, read capabilities, program the input
    /// buffer size, and put the device into D0i3.
    ///
    /// # Errors
    ///
    /// `MmioSizeMismatch` when BAR0 is not the expected size, or a power
    /// transition error.
    pub fn prepare_hardware(&self) -> Result<Capabilities> {
        let hw = self.processor.hardware();
        let window = hw.registers();
        if !bar::is_expected_mmio_len(window.len()) {
            return Err(GnaError::MmioSizeMismatch {
                expected: bar0::SIZE,
                actual: window.len(),
            });
        }

        let caps = *self.capabilities.get_or_init(|| Capabilities::read(window));
        window.write32(regs::IBUFFS, self.config.input_buffer_size);
        hw.power_transition(true)?;
        info!("GNA device ready: {caps}");
        Ok(caps)
    }

    /// Capabilities read at prepare time
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.get().copied()
    }

    /// Configuration in effect
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Device entered D0: start accepting requests.
    pub fn on_power_entry(&self) {
        self.processor.set_accepting(true);
        debug!("Power entry, accepting requests");
    }

    /// Device is leaving D0: cancel the active request, purge the queue,
    /// stop the hardware. Returns once nothing is left in flight.
    pub fn on_power_exit(&self) {
        self.processor.shut_down();
        info!("Power exit, device idle");
    }

    /// `true` between power entry and power exit
    pub fn is_accepting(&self) -> bool {
        self.processor.is_accepting()
    }

    /// Open a session.
    pub fn open_session(&self) -> Arc<Session> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!("Opened session {id}");
        Arc::new(Session::new(id, self.config.registry_scope))
    }

    /// Pin `length` bytes at `address` for `session` and build its page table.
    ///
    /// # Errors
    ///
    /// `InvalidSize`, `NullArgument`, `BadAlignment`, `RegistryFull`,
    /// `TooLarge` or `MappingFailure`. Nothing is left allocated on error.
    pub fn map(&self, session: &Session, address: u64, length: usize) -> Result<MemoryId> {
        if session.is_closed() {
            return Err(GnaError::invalid_parameter("session is closed"));
        }
        validate_map_request(address, length)?;

        let mut registry = session.registry();
        let id = registry.reserve_id()?;
        let context = MemoryContext::map(self.platform.as_ref(), id, address, length)?;
        registry.insert(Arc::new(context))
    }

    /// Release memory `id` of `session`. Requests of the session still
    /// queued are cancelled first, as is the active one if it runs against
    /// this memory. Unmapping an unknown identifier is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a closed session.
    pub fn unmap(&self, session: &Session, id: MemoryId) -> Result<()> {
        if session.is_closed() {
            return Err(GnaError::invalid_parameter("session is closed"));
        }
        if session.memory(id).is_none() {
            debug!("Memory {id} of session {} not mapped, nothing to do", session.id());
            return Ok(());
        }

        self.processor.cancel_by_application(session.id());

        let removed = session.registry().remove(id);
        if let Some(context) = removed {
            self.processor.release_memory(session.id(), &[context]);
            session.fire_notify(RequestStatus::MemoryReleased(id));
            info!("Unmapped memory {id} of session {}", session.id());
        }
        Ok(())
    }

    /// Submit a raw scoring request. Validation failures are reported
    /// through the returned handle, not here.
    ///
    /// # Errors
    ///
    /// `DeviceRemoved` outside D0, `Cancelled` for a closed session.
    pub fn submit(&self, session: &Arc<Session>, payload: impl Into<Bytes>) -> Result<RequestHandle> {
        if !self.processor.is_accepting() {
            return Err(GnaError::DeviceRemoved);
        }
        if session.is_closed() {
            return Err(GnaError::Cancelled);
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (request, handle) = ScoreRequest::new(id, Arc::clone(session), payload.into());
        self.processor.submit(request);
        Ok(handle)
    }

    /// Park a request completed when one of the session's memory contexts
    /// is unmapped (or cancelled when the session closes).
    ///
    /// # Errors
    ///
    /// `Cancelled` for a closed session.
    pub fn arm_notify(&self, session: &Arc<Session>) -> Result<RequestHandle> {
        if session.is_closed() {
            return Err(GnaError::Cancelled);
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (request, handle) = ScoreRequest::new(id, Arc::clone(session), Bytes::new());
        session.arm_notify(request);
        Ok(handle)
    }

    /// Tear down a session: cancel its requests, release its memory.
    pub fn close_session(&self, session: &Session) {
        if !session.close() {
            return;
        }
        let queued = self.processor.cancel_by_application(session.id());
        let contexts = session.registry().drain();
        let released = contexts.len();
        let active = self.processor.release_memory(session.id(), &contexts);
        session.fire_notify(RequestStatus::Cancelled);
        info!(
            "Closed session {}: {queued} queued and {} active request(s) cancelled, {released} mapping(s) released",
            session.id(),
            usize::from(active)
        );
    }

    /// Cancel every queued request of `session`
    pub fn cancel_by_application(&self, session: &Session) -> usize {
        self.processor.cancel_by_application(session.id())
    }

    /// Deferred interrupt work
    pub fn on_interrupt(&self) -> InterruptOutcome {
        self.processor.on_interrupt()
    }

    /// Recovery timer expiry
    pub fn on_timeout(&self) -> TimeoutOutcome {
        self.processor.on_timeout()
    }

    /// The score processor
    pub fn processor(&self) -> &ScoreProcessor {
        &self.processor
    }

    /// Hardware control
    pub fn hardware(&self) -> &HardwareControl {
        self.processor.hardware()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.processor.is_accepting() {
            self.processor.shut_down();
        }
    }
}
