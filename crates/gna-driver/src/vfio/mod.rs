//! VFIO host platform.
//!
//! Runs the driver core in user space against a device bound to `vfio-pci`:
//!
//! - BAR0 is mapped through [`MappedRegion`]
//! - user pages are locked with `mlock` and entered into the IOMMU at a
//!   private IOVA, so the device sees every pinned buffer as one run
//! - common buffers are page-aligned heap allocations mapped the same way
//! - the MSI vector is routed to an eventfd serviced by a listener thread
//!
//! # Requirements
//!
//! 1. IOMMU enabled (`intel_iommu=on`)
//! 2. Device bound to `vfio-pci` (see [`bind_to_vfio`])
//! 3. Read/write access to `/dev/vfio/{group}`

// Hardware access requires exact type casts for ioctl structures
#![allow(clippy::cast_possible_truncation)]

use crate::device::Device;
use crate::error::PlatformError;
use crate::mmio::MappedRegion;
use crate::platform::{CommonBuffer, DmaPlatform, PinnedPages, SgElement};
use gna_chip::bar::bar0;
use gna_chip::descriptor::PAGE_SIZE;
use gna_chip::pcie::{ALL_DEVICE_IDS, INTEL_VENDOR_ID};
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::fs::{File, OpenOptions};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// These are calculated as: _IO(';', base + offset)
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    const VFIO_TYPE: u8 = b';';
    const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// `vfio_irq_set` carrying at most one eventfd
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    data: i32,
}

/// First IOVA handed out. Below it the IOMMU may reserve ranges.
const IOVA_BASE: u64 = 0x1000_0000;

fn last_os_error(what: &str) -> PlatformError {
    PlatformError::io(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// The VFIO container plus the IOVA allocator for everything it maps.
#[derive(Debug)]
struct Container {
    file: File,
    next_iova: AtomicU64,
}

impl Container {
    fn reserve_iova(&self, size: usize) -> u64 {
        self.next_iova.fetch_add(size as u64, Ordering::Relaxed)
    }

    fn map_dma(&self, vaddr: u64, iova: u64, size: usize) -> Result<(), PlatformError> {
        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr,
            iova,
            size: size as u64,
        };

        // SAFETY: VFIO_IOMMU_MAP_DMA enters [vaddr, vaddr + size) into the
        // IOMMU at iova. Invariants: (1) container fd is open with Type1v2
        // set; (2) the range is locked by the caller; (3) layout matches the
        // kernel's vfio_iommu_type1_dma_map.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };
        if ret < 0 {
            return Err(match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ENOMEM | libc::ENOSPC) => PlatformError::OutOfResources,
                _ => last_os_error("VFIO_IOMMU_MAP_DMA"),
            });
        }
        tracing::trace!("IOMMU map {vaddr:#x} -> iova {iova:#x} ({size:#x} bytes)");
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: usize) -> Result<(), PlatformError> {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova,
            size: size as u64,
        };

        // SAFETY: VFIO_IOMMU_UNMAP_DMA removes a range this container mapped.
        // Invariants: (1) container fd valid; (2) iova/size are exactly a
        // prior map_dma; (3) layout matches vfio_iommu_type1_dma_unmap.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            )
        };
        if ret < 0 {
            return Err(last_os_error("VFIO_IOMMU_UNMAP_DMA"));
        }
        Ok(())
    }
}

/// Locked user buffer, visible to the device as a single IOVA run.
#[derive(Debug)]
struct PinnedRegion {
    container: Arc<Container>,
    address: u64,
    length: usize,
    iova: u64,
    runs: [SgElement; 1],
    locked: bool,
}

impl PinnedPages for PinnedRegion {
    fn scatter_gather(&self) -> &[SgElement] {
        &self.runs
    }

    fn with_memory(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        // SAFETY: the region was locked in pin_user_pages and is still locked
        // (with_memory is only reachable through a live mapping). The caller
        // of map() handed these pages to the driver for the mapping lifetime.
        let memory =
            unsafe { std::slice::from_raw_parts_mut(self.address as *mut u8, self.length) };
        f(memory);
    }

    fn unlock(&mut self) -> Result<(), PlatformError> {
        if !std::mem::replace(&mut self.locked, false) {
            return Ok(());
        }
        let unmapped = self.container.unmap_dma(self.iova, self.length);

        // SAFETY: munlock on exactly the range locked in pin_user_pages.
        let unlocked = unsafe { munlock(self.address as *mut _, self.length) };

        unmapped?;
        unlocked.map_err(|_| PlatformError::AccessViolation)
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!("Unlocking pinned region at {:#x}: {e}", self.address);
        }
    }
}

/// Page-aligned, zeroed, IOMMU-mapped allocation
#[derive(Debug)]
struct DmaRegion {
    container: Arc<Container>,
    vaddr: NonNull<u8>,
    layout: Layout,
    iova: u64,
}

// SAFETY: Send - DmaRegion owns its allocation exclusively; nothing else
// holds the pointer, so moving the owner between threads is sound.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    fn new(container: Arc<Container>, length: usize) -> Result<Self, PlatformError> {
        let size = length.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| PlatformError::OutOfResources)?;

        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let vaddr = NonNull::new(raw).ok_or(PlatformError::OutOfResources)?;

        // SAFETY: mlock keeps the pages resident for DMA. Invariants: (1)
        // vaddr is a fresh allocation of layout.size() bytes; (2) released in
        // Drop via munlock before dealloc.
        if let Err(e) = unsafe { mlock(vaddr.as_ptr().cast(), size) } {
            // SAFETY: vaddr/layout come from the alloc_zeroed above.
            unsafe { std::alloc::dealloc(vaddr.as_ptr(), layout) };
            return Err(PlatformError::io(format!("mlock of DMA buffer failed: {e}")));
        }

        let iova = container.reserve_iova(size);
        if let Err(e) = container.map_dma(vaddr.as_ptr() as u64, iova, size) {
            // SAFETY: undo the mlock and alloc above; nothing else saw vaddr.
            unsafe {
                let _ = munlock(vaddr.as_ptr().cast(), size);
                std::alloc::dealloc(vaddr.as_ptr(), layout);
            }
            return Err(e);
        }

        tracing::debug!("Allocated DMA buffer: {size:#x} bytes at iova={iova:#x}");
        Ok(Self {
            container,
            vaddr,
            layout,
            iova,
        })
    }
}

impl CommonBuffer for DmaRegion {
    fn physical_address(&self) -> u64 {
        self.iova
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: vaddr is valid for layout.size() bytes and owned by self.
        unsafe { std::slice::from_raw_parts(self.vaddr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.vaddr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Err(e) = self.container.unmap_dma(self.iova, self.layout.size()) {
            tracing::warn!("Unmapping DMA buffer at iova={:#x}: {e}", self.iova);
        }

        // SAFETY: munlock then dealloc the allocation made in new(). The
        // IOMMU no longer references it and no slices outlive self.
        unsafe {
            let _ = munlock(self.vaddr.as_ptr().cast(), self.layout.size());
            std::alloc::dealloc(self.vaddr.as_ptr(), self.layout);
        }

        tracing::debug!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}

/// [`DmaPlatform`] over a VFIO container.
#[derive(Debug, Clone)]
pub struct VfioPlatform {
    container: Arc<Container>,
}

impl DmaPlatform for VfioPlatform {
    fn pin_user_pages(
        &self,
        address: u64,
        length: usize,
    ) -> Result<Box<dyn PinnedPages>, PlatformError> {
        // SAFETY: mlock only changes residency of the caller's own mapping;
        // a range that is not mapped fails with ENOMEM and changes nothing.
        unsafe { mlock(address as *mut _, length) }.map_err(|e| match e {
            rustix::io::Errno::NOMEM | rustix::io::Errno::FAULT => PlatformError::AccessViolation,
            rustix::io::Errno::AGAIN | rustix::io::Errno::PERM => PlatformError::OutOfResources,
            other => PlatformError::from(other),
        })?;

        let iova = self.container.reserve_iova(length);
        if let Err(e) = self.container.map_dma(address, iova, length) {
            // SAFETY: undo the mlock above.
            unsafe {
                let _ = munlock(address as *mut _, length);
            }
            return Err(e);
        }

        Ok(Box::new(PinnedRegion {
            container: Arc::clone(&self.container),
            address,
            length,
            iova,
            runs: [SgElement::new(iova, length)],
            locked: true,
        }))
    }

    fn alloc_common_buffer(&self, length: usize) -> Result<Box<dyn CommonBuffer>, PlatformError> {
        Ok(Box::new(DmaRegion::new(Arc::clone(&self.container), length)?))
    }
}

/// An open VFIO device: container, group and device descriptors.
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    container: Arc<Container>,
    /// Kept open: closing the group detaches it from the container
    _group: File,
    device: File,
    num_irqs: u32,
}

impl VfioDevice {
    /// Open the device at `pcie_address` (e.g. `0000:00:08.0`).
    ///
    /// # Errors
    ///
    /// Returns an error if IOMMU is not enabled, the device is not bound to
    /// `vfio-pci`, or any VFIO setup ioctl fails.
    pub fn open(pcie_address: &str) -> Result<Self, PlatformError> {
        tracing::info!("Opening {pcie_address} through VFIO");

        let group_number = iommu_group(pcie_address)?;
        tracing::debug!("IOMMU group: {group_number}");

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| PlatformError::io(format!("Cannot open /dev/vfio/vfio: {e}")))?;

        // SAFETY: VFIO_GET_API_VERSION takes no argument and returns an int.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(PlatformError::io(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: VFIO_CHECK_EXTENSION takes the extension id by value and
        // returns 1 when supported.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(PlatformError::io("VFIO Type1v2 IOMMU not supported"));
        }

        let group_path = format!("/dev/vfio/{group_number}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| PlatformError::io(format!("Cannot open {group_path}: {e}")))?;

        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };

        // SAFETY: VFIO_GROUP_GET_STATUS fills group_status. Invariants: (1)
        // group fd valid; (2) layout matches vfio_group_status.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };
        if ret < 0 || group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(PlatformError::io(
                "VFIO group not viable (all devices must be bound to vfio-pci)",
            ));
        }

        // SAFETY: VFIO_GROUP_SET_CONTAINER reads the container fd through
        // the pointer. Invariants: group viable, container open.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to set container"));
        }

        // SAFETY: VFIO_SET_IOMMU takes the IOMMU type by value. Invariants:
        // a group is attached and Type1v2 is supported (checked above).
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to set IOMMU"));
        }

        let address_cstr = std::ffi::CString::new(pcie_address)
            .map_err(|e| PlatformError::io(format!("Invalid PCIe address: {e}")))?;

        // SAFETY: VFIO_GROUP_GET_DEVICE_FD reads a NUL-terminated device name
        // and returns a new fd or -1.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                address_cstr.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(last_os_error("Failed to get device fd"));
        }

        // SAFETY: device_fd is a fresh open fd from the ioctl above; the
        // OwnedFd takes sole ownership and closes it.
        let device = File::from(unsafe { OwnedFd::from_raw_fd(device_fd) });

        let mut device_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_INFO fills device_info. Invariants: (1)
        // device fd valid; (2) layout matches vfio_device_info.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut device_info,
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to get device info"));
        }

        tracing::info!(
            "VFIO device {pcie_address}: {} regions, {} IRQs",
            device_info.num_regions,
            device_info.num_irqs
        );

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container: Arc::new(Container {
                file: container,
                next_iova: AtomicU64::new(IOVA_BASE),
            }),
            _group: group,
            device,
            num_irqs: device_info.num_irqs,
        })
    }

    /// PCIe address the device was opened at
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Map the register window
    ///
    /// # Errors
    ///
    /// Returns an error if the region query or mmap fails.
    pub fn map_registers(&self) -> Result<MappedRegion, PlatformError> {
        MappedRegion::map(&self.device, bar0::VFIO_INDEX)
    }

    /// DMA platform sharing this device's IOMMU container
    pub fn platform(&self) -> VfioPlatform {
        VfioPlatform {
            container: Arc::clone(&self.container),
        }
    }

    /// Route the MSI vector to an eventfd and service it on a thread that
    /// calls [`Device::on_interrupt`] until the listener is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no MSI vector or the eventfd
    /// cannot be created or attached.
    pub fn listen_interrupts(&self, device: Weak<Device>) -> Result<InterruptListener, PlatformError> {
        if self.num_irqs <= ioctls::VFIO_PCI_MSI_IRQ_INDEX {
            return Err(PlatformError::io("device exposes no MSI vector"));
        }
        let event = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        self.set_msi_trigger(Some(event.as_raw_fd()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("gna-irq".into())
            .spawn(move || service_interrupts(&event, &worker_stop, &device))
            .map_err(PlatformError::from);
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                let _ = self.set_msi_trigger(None);
                return Err(e);
            }
        };

        Ok(InterruptListener {
            stop,
            worker: Some(worker),
        })
    }

    /// Attach `eventfd` to the MSI vector, or detach it with `None`.
    fn set_msi_trigger(&self, eventfd: Option<i32>) -> Result<(), PlatformError> {
        let (data_flag, count, data) = match eventfd {
            Some(fd) => (ioctls::VFIO_IRQ_SET_DATA_EVENTFD, 1, fd),
            None => (ioctls::VFIO_IRQ_SET_DATA_NONE, 0, 0),
        };
        let irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags: data_flag | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count,
            data,
        };

        // SAFETY: VFIO_DEVICE_SET_IRQS reads irq_set and `count` trailing
        // eventfds. Invariants: (1) device fd valid; (2) layout matches
        // vfio_irq_set followed by one i32; (3) the eventfd outlives the
        // attachment (the listener detaches before dropping it).
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };
        if ret < 0 {
            return Err(last_os_error("VFIO_DEVICE_SET_IRQS"));
        }
        Ok(())
    }
}

/// How long the interrupt thread blocks before checking for shutdown
const IRQ_POLL_MS: i32 = 100;

fn service_interrupts(event: &OwnedFd, stop: &AtomicBool, device: &Weak<Device>) {
    let mut counter = [0u8; 8];
    while !stop.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(event, PollFlags::IN)];
        match poll(&mut fds, IRQ_POLL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => {
                tracing::error!("Interrupt eventfd poll failed: {e}");
                return;
            }
        }
        if rustix::io::read(event, &mut counter).is_err() {
            continue;
        }
        let Some(device) = device.upgrade() else {
            return;
        };
        let outcome = device.on_interrupt();
        tracing::trace!("MSI: {outcome:?}");
    }
}

/// Interrupt servicing thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct InterruptListener {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ── VFIO device binding helpers ───────────────────────────────────────────────

fn sysfs_device(pcie_address: &str) -> String {
    format!("/sys/bus/pci/devices/{pcie_address}")
}

fn read_sysfs_hex(path: &str) -> Result<u16, PlatformError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PlatformError::io(format!("Cannot read {path}: {e}")))?;
    parse_sysfs_hex(&raw).ok_or_else(|| PlatformError::io(format!("Cannot parse {path}: {raw:?}")))
}

fn parse_sysfs_hex(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).ok()
}

/// Device ID of the GNA at `pcie_address`.
///
/// # Errors
///
/// Returns an error if sysfs cannot be read or the function is not a GNA.
pub fn gna_device_id(pcie_address: &str) -> Result<u16, PlatformError> {
    let base = sysfs_device(pcie_address);
    let vendor = read_sysfs_hex(&format!("{base}/vendor"))?;
    let device = read_sysfs_hex(&format!("{base}/device"))?;
    if vendor != INTEL_VENDOR_ID || !ALL_DEVICE_IDS.contains(&device) {
        return Err(PlatformError::io(format!(
            "{pcie_address} is {vendor:04x}:{device:04x}, not a GNA"
        )));
    }
    Ok(device)
}

/// PCIe addresses of every GNA function present on the host.
///
/// # Errors
///
/// Returns an error if `/sys/bus/pci/devices` cannot be listed.
pub fn discover() -> Result<Vec<String>, PlatformError> {
    let mut found: Vec<String> = std::fs::read_dir("/sys/bus/pci/devices")?
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .filter(|address| gna_device_id(address).is_ok())
        .collect();
    found.sort();
    Ok(found)
}

/// Bind a GNA device to `vfio-pci`, unloading any existing driver.
///
/// Requires root or CAP_SYS_ADMIN.
///
/// # Errors
///
/// Returns an error if the function is not a GNA or any sysfs write fails
/// (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<(), PlatformError> {
    let device = gna_device_id(pcie_address)?;
    tracing::info!("Binding {pcie_address} to vfio-pci");

    let driver_unbind = format!("{}/driver/unbind", sysfs_device(pcie_address));
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address)
            .map_err(|e| PlatformError::io(format!("Cannot unbind {pcie_address}: {e}")))?;
        tracing::info!("Unbound from existing driver");
    }

    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        // EEXIST when the id was registered before; bind below still works
        if let Err(e) = std::fs::write(new_id, format!("{INTEL_VENDOR_ID:04x} {device:04x}")) {
            tracing::debug!("vfio-pci/new_id: {e}");
        }
    }

    let bind_path = "/sys/bus/pci/drivers/vfio-pci/bind";
    if !Path::new(&format!("{}/driver", sysfs_device(pcie_address))).exists() {
        std::fs::write(bind_path, pcie_address)
            .map_err(|e| PlatformError::io(format!("Cannot bind to vfio-pci: {e}")))?;
    }

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci` and re-bind to the `intel_gna` kernel driver
/// when it is loaded.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<(), PlatformError> {
    std::fs::write("/sys/bus/pci/drivers/vfio-pci/unbind", pcie_address)
        .map_err(|e| PlatformError::io(format!("Cannot unbind from vfio-pci: {e}")))?;

    let bind = "/sys/bus/pci/drivers/intel_gna/bind";
    if Path::new(bind).exists() {
        std::fs::write(bind, pcie_address)
            .map_err(|e| PlatformError::io(format!("Cannot bind to intel_gna: {e}")))?;
        tracing::info!("{pcie_address} re-bound to intel_gna");
    } else {
        tracing::info!("{pcie_address} unbound (intel_gna not loaded)");
    }
    Ok(())
}

/// IOMMU group number of a PCIe device, from its sysfs `iommu_group` link.
///
/// # Errors
///
/// Returns an error if the link cannot be read (IOMMU disabled) or parsed.
pub fn iommu_group(pcie_address: &str) -> Result<u32, PlatformError> {
    let link = format!("{}/iommu_group", sysfs_device(pcie_address));
    let target = std::fs::read_link(&link).map_err(|e| {
        PlatformError::io(format!(
            "Cannot read IOMMU group for {pcie_address}: {e}. Is IOMMU enabled?"
        ))
    })?;
    let group = group_from_link(&target)
        .ok_or_else(|| PlatformError::io(format!("Cannot parse IOMMU group from {target:?}")))?;
    tracing::debug!("{pcie_address} → IOMMU group {group}");
    Ok(group)
}

fn group_from_link(target: &Path) -> Option<u32> {
    target.file_name()?.to_str()?.parse().ok()
}
