//! Platform collaborators: page pinning, DMA buffers, recovery timer.
//!
//! The driver core never touches host paging or timers directly. Whatever
//! hosts it (the VFIO platform in [`crate::vfio`], or the simulated platform
//! in [`crate::sim`]) supplies these capabilities.

use crate::error::PlatformError;
use std::time::Duration;

/// One physically contiguous run of a pinned buffer, as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgElement {
    /// Device-visible address of the run
    pub address: u64,
    /// Run length in bytes
    pub length: usize,
}

impl SgElement {
    /// Create a scatter-gather element
    pub const fn new(address: u64, length: usize) -> Self {
        Self { address, length }
    }
}

/// Locked user pages. Dropping the token without [`PinnedPages::unlock`]
/// leaves the pages locked until the platform reclaims them.
pub trait PinnedPages: Send {
    /// Device-visible runs backing the buffer, in buffer order
    fn scatter_gather(&self) -> &[SgElement];

    /// Run `f` over the CPU view of the pinned buffer
    fn with_memory(&mut self, f: &mut dyn FnMut(&mut [u8]));

    /// Unlock the pages
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::AccessViolation`] when the pages were
    /// released behind the driver's back.
    fn unlock(&mut self) -> Result<(), PlatformError>;
}

/// A zero-initialized, physically contiguous, DMA-visible buffer.
pub trait CommonBuffer: Send {
    /// Device-visible address
    fn physical_address(&self) -> u64;

    /// CPU view for reading
    fn as_slice(&self) -> &[u8];

    /// CPU view for writing
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Page pinning and DMA allocation.
pub trait DmaPlatform: Send + Sync {
    /// Lock `length` bytes of user memory at `address` for device access
    ///
    /// # Errors
    ///
    /// Returns an error if the pages cannot be locked.
    fn pin_user_pages(&self, address: u64, length: usize) -> Result<Box<dyn PinnedPages>, PlatformError>;

    /// Allocate `length` zeroed bytes of contiguous DMA memory
    ///
    /// # Errors
    ///
    /// Returns an error if no DMA memory is available.
    fn alloc_common_buffer(&self, length: usize) -> Result<Box<dyn CommonBuffer>, PlatformError>;
}

/// Callback run when the recovery timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// One-shot recovery timer.
///
/// Arming replaces any previously armed callback.
pub trait TimerService: Send + Sync {
    /// Run `on_expiry` once after `timeout` unless cancelled first
    fn arm(&self, timeout: Duration, on_expiry: TimerCallback);

    /// Cancel the armed callback. Returns `true` if one was pending.
    fn cancel(&self) -> bool;
}
