//! Driver core for the GNA (Gaussian & Neural Accelerator) scoring engine.
//!
//! Everything between an application's scoring request and the device's
//! registers: pinning user buffers and building the MMU page tables that
//! let the device walk them, validating and patching requests into the
//! mapped model, a single-device dispatch queue with completion on
//! interrupt or recovery timeout, per-session memory registries, and the
//! D0/D0i3 power handshake.
//!
//! # Layers
//!
//! ```text
//! Device            sessions, map/unmap, submit, power entry/exit
//!   ScoreProcessor  queue, dispatch, interrupt, timeout, cancellation
//!     HardwareControl   start/abort, status decode, power, perf counters
//!       RegisterInterface   BAR0 (MappedRegion over VFIO, or SimRegisters)
//!   MemoryContext   pinned pages + page table + hardware descriptor
//!     DmaPlatform       pinning and DMA memory (VfioPlatform, or SimPlatform)
//! ```
//!
//! # Quick start (simulated)
//!
//! ```
//! use gna_driver::layout::RequestBuilder;
//! use gna_driver::sim::SimulatedDevice;
//! use gna_driver::{DriverConfig, HardwareStatus, RequestStatus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = SimulatedDevice::started(DriverConfig::default())?;
//! sim.platform.add_user_region(0x10_0000, 0x4000);
//!
//! let session = sim.device.open_session();
//! let memory = sim.device.map(&session, 0x10_0000, 0x4000)?;
//! let handle = sim.device.submit(&session, RequestBuilder::new(memory, 1).build())?;
//!
//! sim.regs.complete_score();
//! sim.device.on_interrupt();
//! assert_eq!(handle.wait().status, RequestStatus::Hardware(HardwareStatus::Success));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod capabilities;
mod config;
mod device;
mod error;
mod hw;
pub mod layout;
pub mod memory;
pub mod mmio;
pub mod platform;
mod poll;
mod queue;
mod registry;
mod request;
mod score;
mod session;
pub mod sim;
mod state;
mod timer;
pub mod vfio;

/// Hardware identification constants (re-exported from gna-chip).
pub mod pcie_ids {
    pub use gna_chip::pcie::device_id;
    pub use gna_chip::pcie::{lspci_filter, Generation, ALL_DEVICE_IDS, INTEL_VENDOR_ID};
}

pub use capabilities::Capabilities;
pub use config::{DriverConfig, RegistryScope};
pub use device::Device;
pub use error::{GnaError, PlatformError, Result};
pub use hw::{ExecutionConfig, HardwareControl, HardwareStatus};
pub use memory::{MemoryContext, MemoryId};
pub use poll::PollPolicy;
pub use queue::RequestQueue;
pub use registry::MemoryRegistry;
pub use request::{
    HardwarePerf, RequestHandle, RequestId, RequestStatus, ScoreReport, ScoreRequest, SessionId,
};
pub use score::{InterruptOutcome, ScoreProcessor, TimeoutOutcome};
pub use session::Session;
pub use timer::ThreadTimer;
pub use vfio::{VfioDevice, VfioPlatform};
