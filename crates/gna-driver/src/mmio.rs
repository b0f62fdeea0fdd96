//! Register interface and memory-mapped BAR0 access.
//!
//! The driver core only ever talks to hardware through [`RegisterInterface`].
//! [`MappedRegion`] implements it over a VFIO-mapped BAR; the simulated
//! device in [`crate::sim`] implements it over a register model.

// Register offsets are 4-byte aligned and the window is page aligned.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::items_after_statements)]

use crate::error::PlatformError;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};

/// 32-bit register access to the device's BAR0 window.
pub trait RegisterInterface: Send + Sync {
    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);

    /// Size of the register window in bytes
    fn len(&self) -> usize;

    /// `true` when the window is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-modify-write: set `mask` bits
    fn set_bits(&self, offset: usize, mask: u32) {
        let value = self.read32(offset);
        self.write32(offset, value | mask);
    }

    /// Read-modify-write: clear `mask` bits
    fn clear_bits(&self, offset: usize, mask: u32) {
        let value = self.read32(offset);
        self.write32(offset, value & !mask);
    }
}

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
pub struct VfioRegionInfo {
    /// Size of this structure (for versioning)
    pub argsz: u32,
    /// Region flags (capabilities, permissions)
    pub flags: u32,
    /// Region index (BAR number)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset from mmap base
    pub offset: u64,
}

/// Mapped BAR region for MMIO access
pub struct MappedRegion {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// BAR index
    bar: u32,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; the mapping is
// process-wide, so moving the owner between threads keeps it valid.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a single bounds-checked volatile load or
// store of an aligned u32; the device serializes concurrent register access.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map a BAR region via VFIO
    ///
    /// # Errors
    ///
    /// Returns an error if the region-info ioctl or the mmap fails.
    pub fn map(device_fd: &File, bar: u32) -> Result<Self, PlatformError> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar,
            ..Default::default()
        };

        // VFIO_DEVICE_GET_REGION_INFO = _IO(';', 100 + 8)
        const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = (b';' as libc::c_ulong) << 8 | 108;

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO fills region_info for the BAR.
        // Invariants: (1) device_fd is an open VFIO device; (2) region_info is
        // initialized with argsz and index; (3) layout matches the kernel's.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut region_info,
            )
        };

        if ret < 0 {
            return Err(PlatformError::io(format!(
                "Failed to get BAR{bar} info: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::debug!(
            "BAR{}: size={:#x}, offset={:#x}, flags={:#x}",
            bar,
            region_info.size,
            region_info.offset,
            region_info.flags
        );

        // SAFETY: maps the BAR reported by the kernel. Invariants: (1) fd is
        // valid; (2) size/offset come from the successful ioctl above; (3) the
        // pointer is valid for size bytes until munmap in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                region_info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                region_info.offset,
            )
            .map_err(|e| PlatformError::io(format!("Failed to mmap BAR{bar}: {e}")))?
        };

        tracing::info!("Mapped BAR{bar} at {ptr:p}, size={:#x}", region_info.size);

        Ok(Self {
            ptr: ptr.cast(),
            size: region_info.size as usize,
            bar,
        })
    }

    /// Get BAR index
    pub const fn bar(&self) -> u32 {
        self.bar
    }
}

impl RegisterInterface for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "register {offset:#x} outside BAR{}", self.bar);
        // SAFETY: read_volatile is required for MMIO. Invariants: (1) ptr
        // from mmap, valid for self.size; (2) offset + 4 <= size; (3) aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "register {offset:#x} outside BAR{}", self.bar);
        // SAFETY: write_volatile triggers hardware side effects. Invariants:
        // (1) ptr from mmap; (2) offset + 4 <= size; (3) aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly the mapping created in map(); Drop
        // runs once and no references outlive self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped BAR{}", self.bar);
    }
}
