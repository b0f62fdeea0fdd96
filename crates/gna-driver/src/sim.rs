// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated device for development and CI.
//!
//! Everything the driver core needs from the outside world, without
//! hardware:
//!
//! | Piece | Stands in for |
//! |-------|---------------|
//! | [`SimRegisters`] | BAR0 register window with the device's behavior |
//! | [`SimPlatform`] | Page pinning, scatter-gather, DMA buffers |
//! | [`ManualTimer`] | Recovery timer that fires when told to |
//! | [`SimulatedDevice`] | All of the above wired to a [`Device`] |
//!
//! The register model counts every write, so tests can prove that a path
//! never touched the hardware. The platform counts live pins and buffers,
//! so tests can prove that a failed path leaked nothing.

use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::{self, PlatformError};
use crate::mmio::RegisterInterface;
use crate::platform::{CommonBuffer, DmaPlatform, PinnedPages, SgElement, TimerCallback, TimerService};
use gna_chip::bar::bar0;
use gna_chip::descriptor::PAGE_SIZE;
use gna_chip::regs::{self, control, d0i3, status};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Reads of `D0I3C` before a power command reports done.
const POWER_COMMAND_READS: u32 = 2;

struct RegisterFile {
    values: Vec<u32>,
    writes: usize,
    d0i3: bool,
    cip_reads_left: u32,
    cip_stuck: bool,
    refuse_d0i3: bool,
    abort_stuck: bool,
}

impl RegisterFile {
    fn get(&self, offset: usize) -> u32 {
        self.values[offset / 4]
    }

    fn set(&mut self, offset: usize, value: u32) {
        self.values[offset / 4] = value;
    }

    fn write_control(&mut self, value: u32) {
        let previous = self.get(regs::CTRL);
        if value & control::ABORT_CLEAR != 0 {
            if self.abort_stuck {
                self.set(regs::CTRL, value);
                return;
            }
            self.set(regs::CTRL, value & !(control::ABORT_CLEAR | control::START));
            let sts = self.get(regs::STS);
            self.set(regs::STS, sts & !status::ACTIVE);
            return;
        }
        self.set(regs::CTRL, value);
        if value & control::START != 0 && previous & control::START == 0 {
            self.set(regs::STS, status::ACTIVE);
        }
    }

    fn write_power(&mut self, value: u32) {
        if self.cip_stuck {
            return;
        }
        if !self.refuse_d0i3 {
            self.d0i3 = value & d0i3::D0I3 != 0;
        }
        self.cip_reads_left = POWER_COMMAND_READS;
    }

    fn read_power(&mut self) -> u32 {
        if self.cip_reads_left > 0 {
            self.cip_reads_left -= 1;
        }
        let mut value = 0;
        if self.cip_stuck || self.cip_reads_left > 0 {
            value |= d0i3::CIP;
        }
        if self.d0i3 {
            value |= d0i3::D0I3;
        }
        value
    }
}

/// Behavioral model of the BAR0 register window.
///
/// - `STS` is write-one-to-clear.
/// - Writing `CTRL` with `START` marks the engine active; `ABORT_CLEAR`
///   self-clears and stops the engine.
/// - A `D0I3C` write reports command-in-progress for two reads.
pub struct SimRegisters {
    len: usize,
    file: Mutex<RegisterFile>,
}

impl std::fmt::Debug for SimRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRegisters")
            .field("len", &self.len)
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    /// A GNA 2.0 register window of the expected size
    pub fn new() -> Self {
        Self::with_len(bar0::SIZE)
    }

    /// A window of `len` bytes
    pub fn with_len(len: usize) -> Self {
        let mut values = vec![0; len.max(bar0::SIZE) / 4];
        values[regs::VERSION / 4] = 0x20;
        Self {
            len,
            file: Mutex::new(RegisterFile {
                values,
                writes: 0,
                d0i3: false,
                cip_reads_left: 0,
                cip_stuck: false,
                refuse_d0i3: false,
                abort_stuck: false,
            }),
        }
    }

    fn file(&self) -> MutexGuard<'_, RegisterFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `VERSION` and `FEATURES`
    pub fn set_identity(&self, version: u32, features: u32) {
        let mut file = self.file();
        file.set(regs::VERSION, version);
        file.set(regs::FEATURES, features);
    }

    /// Register writes so far
    pub fn write_count(&self) -> usize {
        self.file().writes
    }

    /// `true` while the model is in D0i3
    pub fn in_d0i3(&self) -> bool {
        self.file().d0i3
    }

    /// `true` while `START` is asserted
    pub fn is_started(&self) -> bool {
        self.file().get(regs::CTRL) & control::START != 0
    }

    /// Register value, without side effects
    pub fn peek(&self, offset: usize) -> u32 {
        self.file().get(offset)
    }

    /// Finish the running score: completed, engine idle
    pub fn complete_score(&self) {
        let mut file = self.file();
        let sts = file.get(regs::STS);
        file.set(regs::STS, (sts & !status::ACTIVE) | status::COMPLETED | status::STATISTICS_VALID);
        let ctrl = file.get(regs::CTRL);
        file.set(regs::CTRL, ctrl & !control::START);
    }

    /// OR `bits` into `STS`
    pub fn raise_status(&self, bits: u32) {
        let mut file = self.file();
        let sts = file.get(regs::STS);
        file.set(regs::STS, sts | bits);
    }

    /// Load the cycle counters
    pub fn set_perf(&self, total_cycles: u32, stall_cycles: u32) {
        let mut file = self.file();
        file.set(regs::PTC, total_cycles);
        file.set(regs::PSC, stall_cycles);
    }

    /// Power commands never finish
    pub fn stick_power_command(&self) {
        self.file().cip_stuck = true;
    }

    /// Power commands finish but the device stays in D0
    pub fn refuse_d0i3(&self) {
        self.file().refuse_d0i3 = true;
    }

    /// `ABORT_CLEAR` never self-clears
    pub fn stick_abort(&self) {
        self.file().abort_stuck = true;
    }
}

impl RegisterInterface for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "Register offset out of bounds");
        let mut file = self.file();
        if offset == regs::D0I3C {
            return file.read_power();
        }
        file.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "Register offset out of bounds");
        let mut file = self.file();
        file.writes += 1;
        match offset {
            regs::STS => {
                let sts = file.get(regs::STS);
                file.set(regs::STS, sts & !value);
            }
            regs::CTRL => file.write_control(value),
            regs::D0I3C => file.write_power(value),
            _ => file.set(offset, value),
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

struct UserRegion {
    base: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl UserRegion {
    fn contains(&self, address: u64, length: usize) -> bool {
        let len = self.data.lock().unwrap_or_else(PoisonError::into_inner).len();
        address >= self.base && address + length as u64 <= self.base + len as u64
    }
}

struct PlatformState {
    regions: Vec<UserRegion>,
    scatter_gather: Option<Vec<SgElement>>,
    next_physical: u64,
    allocations_left: Option<usize>,
    unlock_error: Option<PlatformError>,
}

/// Simulated host memory: user address space, pinning, DMA allocation.
pub struct SimPlatform {
    state: Mutex<PlatformState>,
    live_pins: Arc<AtomicUsize>,
    live_allocations: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPlatform")
            .field("live_pins", &self.live_pins())
            .field("live_allocations", &self.live_allocations())
            .finish_non_exhaustive()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    /// Empty address space
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                regions: Vec::new(),
                scatter_gather: None,
                next_physical: 0x8000_0000,
                allocations_left: None,
                unlock_error: None,
            }),
            live_pins: Arc::new(AtomicUsize::new(0)),
            live_allocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `len` zeroed bytes at `base` addressable
    pub fn add_user_region(&self, base: u64, len: usize) {
        self.state().regions.push(UserRegion {
            base,
            data: Arc::new(Mutex::new(vec![0; len])),
        });
    }

    /// Use `sg` for every following pin instead of one element per page
    pub fn set_scatter_gather(&self, sg: Vec<SgElement>) {
        self.state().scatter_gather = Some(sg);
    }

    /// Let `count` more DMA allocations succeed, then fail
    pub fn fail_allocation_after(&self, count: usize) {
        self.state().allocations_left = Some(count);
    }

    /// Make every unlock report `error`
    pub fn fail_unlock_with(&self, error: PlatformError) {
        self.state().unlock_error = Some(error);
    }

    /// Pinned buffers not yet released
    pub fn live_pins(&self) -> usize {
        self.live_pins.load(Ordering::SeqCst)
    }

    /// DMA buffers not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    /// Copy `len` bytes of user memory at `address`
    pub fn read_user(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state();
        let region = state.regions.iter().find(|r| r.contains(address, len))?;
        let start = (address - region.base) as usize;
        let data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
        Some(data[start..start + len].to_vec())
    }

    /// Write user memory at `address`. Returns `false` if unaddressable.
    pub fn write_user(&self, address: u64, bytes: &[u8]) -> bool {
        let state = self.state();
        let Some(region) = state.regions.iter().find(|r| r.contains(address, bytes.len())) else {
            return false;
        };
        let start = (address - region.base) as usize;
        let mut data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
        data[start..start + bytes.len()].copy_from_slice(bytes);
        true
    }

    fn physical_pages(state: &mut PlatformState, len: usize) -> u64 {
        let address = state.next_physical;
        state.next_physical += len.div_ceil(PAGE_SIZE).max(1) as u64 * PAGE_SIZE as u64;
        address
    }
}

impl DmaPlatform for SimPlatform {
    fn pin_user_pages(&self, address: u64, length: usize) -> Result<Box<dyn PinnedPages>, PlatformError> {
        let mut state = self.state();
        let Some(region) = state.regions.iter().find(|r| r.contains(address, length)) else {
            return Err(PlatformError::AccessViolation);
        };
        let data = Arc::clone(&region.data);
        let offset = (address - region.base) as usize;

        let sg = match state.scatter_gather.clone() {
            Some(sg) => sg,
            None => (0..length.div_ceil(PAGE_SIZE))
                .map(|_| SgElement::new(Self::physical_pages(&mut state, PAGE_SIZE), PAGE_SIZE))
                .collect(),
        };

        self.live_pins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimPinned {
            data,
            offset,
            length,
            sg,
            unlock_error: state.unlock_error.clone(),
            live: Some(Arc::clone(&self.live_pins)),
        }))
    }

    fn alloc_common_buffer(&self, length: usize) -> Result<Box<dyn CommonBuffer>, PlatformError> {
        let mut state = self.state();
        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return Err(PlatformError::OutOfResources);
            }
            *left -= 1;
        }
        let physical = Self::physical_pages(&mut state, length);
        self.live_allocations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimBuffer {
            physical,
            data: vec![0; length],
            live: Arc::clone(&self.live_allocations),
        }))
    }
}

struct SimPinned {
    data: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    length: usize,
    sg: Vec<SgElement>,
    unlock_error: Option<PlatformError>,
    live: Option<Arc<AtomicUsize>>,
}

impl PinnedPages for SimPinned {
    fn scatter_gather(&self) -> &[SgElement] {
        &self.sg
    }

    fn with_memory(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut data[self.offset..self.offset + self.length]);
    }

    fn unlock(&mut self) -> Result<(), PlatformError> {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
        match self.unlock_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for SimPinned {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct SimBuffer {
    physical: u64,
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl CommonBuffer for SimBuffer {
    fn physical_address(&self) -> u64 {
        self.physical
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Recovery timer driven by the test.
#[derive(Default)]
pub struct ManualTimer {
    pending: Mutex<Option<(Duration, TimerCallback)>>,
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimer")
            .field("armed", &self.armed_timeout())
            .finish()
    }
}

impl ManualTimer {
    /// Disarmed timer
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Option<(Duration, TimerCallback)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timeout of the armed callback
    pub fn armed_timeout(&self) -> Option<Duration> {
        self.pending().as_ref().map(|(timeout, _)| *timeout)
    }

    /// Run the armed callback now. Returns `false` if nothing was armed.
    pub fn fire(&self) -> bool {
        let armed = self.pending().take();
        let Some((_, callback)) = armed else {
            return false;
        };
        callback();
        true
    }

    /// Detach the armed callback as a timer thread does on expiry, without
    /// running it. Cancelling the timer no longer reaches the returned
    /// callback.
    pub fn expire(&self) -> Option<TimerCallback> {
        self.pending().take().map(|(_, callback)| callback)
    }
}

impl TimerService for ManualTimer {
    fn arm(&self, timeout: Duration, on_expiry: TimerCallback) {
        *self.pending() = Some((timeout, on_expiry));
    }

    fn cancel(&self) -> bool {
        self.pending().take().is_some()
    }
}

/// A [`Device`] wired to simulated collaborators.
#[derive(Debug)]
pub struct SimulatedDevice {
    /// Register model
    pub regs: Arc<SimRegisters>,
    /// Host memory model
    pub platform: Arc<SimPlatform>,
    /// Recovery timer
    pub timer: Arc<ManualTimer>,
    /// The device under test
    pub device: Device,
}

impl SimulatedDevice {
    /// Assemble without preparing the hardware
    pub fn new(config: DriverConfig) -> Self {
        Self::with_registers(SimRegisters::new(), config)
    }

    /// Assemble around a specific register model
    pub fn with_registers(regs: SimRegisters, config: DriverConfig) -> Self {
        let regs = Arc::new(regs);
        let platform = Arc::new(SimPlatform::new());
        let timer = Arc::new(ManualTimer::new());
        let device = Device::new(
            Arc::clone(&regs) as Arc<dyn RegisterInterface>,
            Arc::clone(&platform) as Arc<dyn DmaPlatform>,
            Arc::clone(&timer) as Arc<dyn TimerService>,
            config,
        );
        Self {
            regs,
            platform,
            timer,
            device,
        }
    }

    /// Assemble, prepare, and power on
    ///
    /// # Errors
    ///
    /// Returns an error if hardware preparation fails.
    pub fn started(config: DriverConfig) -> error::Result<Self> {
        let sim = Self::new(config);
        sim.device.prepare_hardware()?;
        sim.device.on_power_entry();
        Ok(sim)
    }
}
