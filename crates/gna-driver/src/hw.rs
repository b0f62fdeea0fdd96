//! Hardware control: start, abort, power transitions, status decoding.
//!
//! A thin sequencing layer over [`RegisterInterface`]. Every wait on the
//! device is a bounded [`PollPolicy`] probe loop.

use crate::error::{GnaError, Result};
use crate::mmio::RegisterInterface;
use crate::poll::PollPolicy;
use crate::request::HardwarePerf;
use crate::state::{LockDomain, PowerState, RequestState};
use gna_chip::descriptor::page_number;
use gna_chip::regs::{self, breakpoint, control, d0i3, status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decoded status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareStatus {
    /// Still processing
    Busy,
    /// Scoring completed
    Success,
    /// Completed with saturated outputs
    Saturated,
    /// Halted at the configured breakpoint layer
    BreakpointPause,
    /// MMU request error
    MmuRequestError,
    /// DMA request error
    DmaRequestError,
    /// Completion signalled with no active request
    UnexpectedCompletion,
    /// Virtual address out of range
    VaOutOfRange,
    /// Parameter out of range
    ParamOutOfRange,
    /// Device stopped responding and was aborted
    DeviceFailure,
}

impl HardwareStatus {
    /// `true` while the device is still processing
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }

    /// `true` for conditions fatal to the request
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            Self::MmuRequestError
                | Self::DmaRequestError
                | Self::UnexpectedCompletion
                | Self::VaOutOfRange
                | Self::ParamOutOfRange
                | Self::DeviceFailure
        )
    }

    const fn from_error_bit(bit: u32) -> Self {
        match bit {
            status::MMU_ERR => Self::MmuRequestError,
            status::DMA_ERR => Self::DmaRequestError,
            status::UNEXPECTED_COMPLETION => Self::UnexpectedCompletion,
            status::VA_OOR => Self::VaOutOfRange,
            _ => Self::ParamOutOfRange,
        }
    }
}

/// Per-request execution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionConfig {
    /// Operating mode (0 = XNN, 1 = GMM)
    pub op_mode: u32,
    /// Enable active-list processing
    pub active_list: bool,
    /// Performance statistics level (0 disables)
    pub stats_level: u32,
}

impl ExecutionConfig {
    /// Control-register value that starts execution with this configuration
    pub const fn control_word(&self) -> u32 {
        let mut value = control::START
            | control::COMP_INT_EN
            | control::ERR_INT_EN
            | control::op_mode(self.op_mode)
            | control::stats(self.stats_level);
        if self.active_list {
            value |= control::ACTIVE_LIST_EN;
        }
        value
    }
}

/// Register-level control of one device.
pub struct HardwareControl {
    regs: Arc<dyn RegisterInterface>,
    poll: PollPolicy,
    interruptible: AtomicBool,
    power: LockDomain<PowerState>,
}

impl std::fmt::Debug for HardwareControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareControl")
            .field("poll", &self.poll)
            .field("interruptible", &self.is_interruptible())
            .field("d0i3", &self.is_asleep())
            .finish_non_exhaustive()
    }
}

impl HardwareControl {
    /// Wrap a register window. The device is assumed awake until told otherwise.
    pub fn new(regs: Arc<dyn RegisterInterface>, poll: PollPolicy) -> Self {
        Self {
            regs,
            poll,
            interruptible: AtomicBool::new(false),
            power: LockDomain::new("power", PowerState::default()),
        }
    }

    /// Register window
    pub fn registers(&self) -> &dyn RegisterInterface {
        self.regs.as_ref()
    }

    /// Start scoring the descriptor at `descriptor` (device address).
    ///
    /// Wakes the device if needed and aborts any leftover execution first.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be woken.
    pub fn start_execution(&self, descriptor: u64, config: ExecutionConfig) -> Result<()> {
        self.power_transition(false)?;

        if self.regs.read32(regs::STS) & status::ACTIVE != 0 {
            debug!("Device still active, aborting before start");
            self.abort();
        }

        self.regs.write32(regs::DESBASE, page_number(descriptor));
        self.interruptible.store(true, Ordering::Release);
        self.regs.write32(regs::CTRL, config.control_word());
        debug!(
            "Started execution: descriptor {descriptor:#x}, ctrl {:#x}",
            config.control_word()
        );
        Ok(())
    }

    /// Best-effort synchronous abort. Returns `false` if the device never
    /// acknowledged within the poll budget.
    pub fn abort(&self) -> bool {
        self.regs.set_bits(regs::CTRL, control::ABORT_CLEAR);
        if self
            .poll
            .until_clear(self.regs.as_ref(), regs::CTRL, control::ABORT_CLEAR)
            .is_some()
        {
            true
        } else {
            warn!("Abort not acknowledged after {} probes", self.poll.max_attempts);
            false
        }
    }

    /// Move the device into (`sleep = true`) or out of D0i3.
    ///
    /// A no-op when the device is already in the requested state.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if a previous power command never finished,
    /// `PowerRequestFailed` if the device did not reach the requested state.
    pub fn power_transition(&self, sleep: bool) -> Result<()> {
        let mut power = self.power.lock();
        if power.d0i3 == sleep {
            return Ok(());
        }

        if self
            .poll
            .until_clear(self.regs.as_ref(), regs::D0I3C, d0i3::CIP)
            .is_none()
        {
            return Err(GnaError::invalid_state_transition(
                "previous power command still in progress",
            ));
        }

        if sleep {
            self.abort();
        }

        self.regs
            .write32(regs::D0I3C, if sleep { d0i3::D0I3 } else { 0 });

        if self
            .poll
            .until_clear(self.regs.as_ref(), regs::D0I3C, d0i3::CIP)
            .is_none()
        {
            return Err(GnaError::PowerRequestFailed { wanted: sleep });
        }

        let reached = self.regs.read32(regs::D0I3C) & d0i3::D0I3 != 0;
        if reached != sleep {
            return Err(GnaError::PowerRequestFailed { wanted: sleep });
        }

        self.regs.clear_bits(
            regs::CTRL,
            control::START | control::ABORT_CLEAR | control::COMP_INT_EN | control::ERR_INT_EN,
        );
        power.d0i3 = sleep;
        debug!("Device {}", if sleep { "entered D0i3" } else { "woke to D0" });
        Ok(())
    }

    /// `true` while the device is in D0i3
    pub fn is_asleep(&self) -> bool {
        self.power.lock().d0i3
    }

    /// `true` while interrupts should be routed to completion
    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    pub(crate) fn set_interruptible(&self, value: bool) {
        self.interruptible.store(value, Ordering::Release);
    }

    /// Read the control register
    pub fn control(&self) -> u32 {
        self.regs.read32(regs::CTRL)
    }

    /// Read the cycle counters
    pub fn perf(&self) -> HardwarePerf {
        HardwarePerf {
            total_cycles: self.regs.read32(regs::PTC),
            stall_cycles: self.regs.read32(regs::PSC),
        }
    }

    /// Pause execution before `layer`
    pub fn set_breakpoint(&self, layer: u32) {
        self.regs.write32(regs::BPLAYER, layer);
        self.regs.write32(regs::BPCTRL, breakpoint::ENABLE);
        self.regs.set_bits(regs::CTRL, control::BP_PAUSE_INT_EN);
    }

    /// Continue after a breakpoint pause
    pub fn resume(&self) {
        self.regs.write32(regs::STS, status::BP_PAUSE);
        self.interruptible.store(true, Ordering::Release);
        self.regs.set_bits(regs::CTRL, control::START);
    }

    /// Read and decode the status register once.
    ///
    /// The completion and error bits that produced the result are cleared,
    /// so a repeated read (a duplicate interrupt) cannot report them again.
    /// Busy while `timed_out` is set means the device is hung: the status is
    /// promoted to `DeviceFailure` and the flag is consumed.
    pub(crate) fn status(&self, request: &LockDomain<RequestState>) -> HardwareStatus {
        self.decode_status(|| std::mem::take(&mut request.lock().timed_out))
    }

    /// [`status`](Self::status) for a caller already holding the request
    /// lock. `take_timed_out` is asked only when the engine reads busy.
    pub(crate) fn decode_status(&self, take_timed_out: impl FnOnce() -> bool) -> HardwareStatus {
        let sts = self.regs.read32(regs::STS);

        if sts & status::COMPLETED != 0 {
            self.regs
                .write32(regs::STS, sts & (status::COMPLETED | status::SATURATED));
            if sts & status::SATURATED != 0 {
                return HardwareStatus::Saturated;
            }
            return HardwareStatus::Success;
        }

        if sts & status::BP_PAUSE != 0 {
            self.regs.clear_bits(regs::CTRL, control::BP_PAUSE_INT_EN);
            self.regs.write32(regs::BPCTRL, 0);
            self.regs.write32(regs::BPLAYER, 0);
            self.interruptible.store(true, Ordering::Release);
            return HardwareStatus::BreakpointPause;
        }

        if sts & status::OUTBUF_FULL != 0 {
            warn!("Output buffer full");
            self.regs.write32(regs::STS, status::OUTBUF_FULL);
        }

        if let Some(&bit) = status::ERRORS.iter().find(|&&bit| sts & bit != 0) {
            self.regs.write32(regs::STS, sts & status::ERROR_MASK);
            return HardwareStatus::from_error_bit(bit);
        }

        if take_timed_out() {
            error!("Device hung in live loop (status {sts:#x})");
            return HardwareStatus::DeviceFailure;
        }
        HardwareStatus::Busy
    }
}
