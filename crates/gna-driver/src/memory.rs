//! Memory mapper: pinned user buffers, MMU page tables, descriptors.
//!
//! Mapping a buffer produces a [`MemoryContext`]:
//!
//! ```text
//! user buffer ──pin──▶ scatter-gather list ──split──▶ page numbers
//!                                                         │
//!        descriptor page ◀── page directory ◀── PT segments (1024 × u32 each)
//! ```
//!
//! Every failure after pinning unwinds the partial mapping before the error
//! is returned, so a failed map leaves nothing locked or allocated.

use crate::error::{GnaError, PlatformError, Result};
use crate::platform::{CommonBuffer, DmaPlatform, PinnedPages};
use gna_chip::descriptor::{
    self, mmu, page_number, required_pt_entries, required_pt_segments, MAX_MAP_SIZE,
    MAX_PT_SEGMENTS, PAGE_SIZE, PT_ENTRIES_PER_SEGMENT, PT_ENTRY_SIZE,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Session-scoped memory identifier
pub type MemoryId = u32;

/// Driver-side copy of the MMU configuration written into the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MmuConfig {
    /// Last valid virtual offset of the mapping
    pub vamaxaddr: u32,
    /// Page number of every page-table segment
    pub page_directory: Vec<u32>,
}

struct Mapping {
    pinned: Option<Box<dyn PinnedPages>>,
    page_table: Vec<Box<dyn CommonBuffer>>,
    descriptor: Option<Box<dyn CommonBuffer>>,
    mmu: MmuConfig,
    applied_config: Option<u64>,
}

impl Mapping {
    fn release(&mut self, id: MemoryId) {
        self.page_table.clear();
        if let Some(mut pinned) = self.pinned.take() {
            match pinned.unlock() {
                Ok(()) => {}
                Err(PlatformError::AccessViolation) => {
                    warn!("Memory {id}: access violation while unlocking pages, continuing");
                }
                Err(e) => warn!("Memory {id}: unlock failed: {e}"),
            }
        }
        self.mmu = MmuConfig::default();
        if let Some(mut descriptor) = self.descriptor.take() {
            descriptor.as_mut_slice().fill(0);
        }
        self.applied_config = None;
    }

    const fn is_live(&self) -> bool {
        self.pinned.is_some()
    }
}

/// Mutable access to a live mapping, handed out under the mapping lock.
pub(crate) struct MappingView<'a> {
    /// The pinned user buffer
    pub user: &'a mut [u8],
    /// The descriptor page
    pub descriptor: &'a mut [u8],
    /// Configuration id whose layer overrides are currently applied
    pub applied_config: &'a mut Option<u64>,
}

/// One mapped user buffer with its page table and descriptor.
pub struct MemoryContext {
    id: MemoryId,
    user_base: u64,
    user_size: usize,
    segment_count: usize,
    descriptor_address: u64,
    mapping: Mutex<Mapping>,
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("id", &self.id)
            .field("user_base", &format_args!("{:#x}", self.user_base))
            .field("user_size", &self.user_size)
            .field("segment_count", &self.segment_count)
            .field("descriptor_address", &format_args!("{:#x}", self.descriptor_address))
            .finish_non_exhaustive()
    }
}

/// Check a map request before anything is allocated.
///
/// # Errors
///
/// `InvalidSize`, `NullArgument` or `BadAlignment`.
pub fn validate_map_request(address: u64, length: usize) -> Result<()> {
    if length == 0 || length > MAX_MAP_SIZE {
        return Err(GnaError::InvalidSize {
            size: length,
            max: MAX_MAP_SIZE,
        });
    }
    if address == 0 {
        return Err(GnaError::NullArgument {
            what: "user buffer address",
        });
    }
    if address % PAGE_SIZE as u64 != 0 {
        return Err(GnaError::BadAlignment { address });
    }
    Ok(())
}

impl MemoryContext {
    /// Pin `length` bytes at `address` and build the device page table.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid, pinning fails, the page
    /// table would be too large, or DMA memory runs out. Nothing stays
    /// allocated on error.
    pub fn map(platform: &dyn DmaPlatform, id: MemoryId, address: u64, length: usize) -> Result<Self> {
        validate_map_request(address, length)?;

        let entries = required_pt_entries(length);
        let segments = required_pt_segments(entries);
        if segments > MAX_PT_SEGMENTS {
            return Err(GnaError::TooLarge {
                segments,
                max: MAX_PT_SEGMENTS,
            });
        }

        let pinned = platform.pin_user_pages(address, length).map_err(|e| {
            GnaError::mapping_failure(format!("cannot lock {length} bytes at {address:#x}: {e}"))
        })?;

        let mut mapping = Mapping {
            pinned: Some(pinned),
            page_table: Vec::with_capacity(segments),
            descriptor: None,
            mmu: MmuConfig::default(),
            applied_config: None,
        };

        if let Err(e) = build_page_table(platform, &mut mapping, length, segments) {
            mapping.release(id);
            return Err(e);
        }

        let descriptor_address = mapping
            .descriptor
            .as_ref()
            .map_or(0, |d| d.physical_address());

        info!(
            "Mapped memory {id}: {length} bytes at {address:#x}, {segments} PT segment(s), descriptor {descriptor_address:#x}"
        );

        Ok(Self {
            id,
            user_base: address,
            user_size: length,
            segment_count: segments,
            descriptor_address,
            mapping: Mutex::new(mapping),
        })
    }

    /// Release pages, page table and descriptor. Idempotent.
    pub fn release(&self) {
        let mut mapping = self.lock();
        if !mapping.is_live() {
            return;
        }
        mapping.release(self.id);
        debug!("Released memory {}", self.id);
    }

    /// Memory identifier
    pub const fn id(&self) -> MemoryId {
        self.id
    }

    /// User virtual base address
    pub const fn user_base(&self) -> u64 {
        self.user_base
    }

    /// Mapped length in bytes
    pub const fn user_size(&self) -> usize {
        self.user_size
    }

    /// Number of page-table segments
    pub const fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Device address of the descriptor page
    pub const fn descriptor_address(&self) -> u64 {
        self.descriptor_address
    }

    /// `true` once [`release`](Self::release) ran
    pub fn is_released(&self) -> bool {
        !self.lock().is_live()
    }

    /// Current MMU configuration (zeroed after release)
    pub fn mmu_config(&self) -> MmuConfig {
        self.lock().mmu.clone()
    }

    /// Configuration id whose layer overrides are applied
    pub fn applied_config(&self) -> Option<u64> {
        self.lock().applied_config
    }

    /// Every page-table entry, segment after segment
    pub fn page_table_entries(&self) -> Vec<u32> {
        self.lock()
            .page_table
            .iter()
            .flat_map(|segment| {
                segment
                    .as_slice()
                    .chunks_exact(PT_ENTRY_SIZE)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Copy of the descriptor page (empty after release)
    pub fn descriptor_bytes(&self) -> Vec<u8> {
        self.lock()
            .descriptor
            .as_ref()
            .map(|d| d.as_slice()[..descriptor::DESCRIPTOR_SIZE].to_vec())
            .unwrap_or_default()
    }

    /// Run `f` against the live mapping.
    ///
    /// # Errors
    ///
    /// `NotMapped` once the context has been released, or whatever `f` returns.
    pub(crate) fn program<R>(&self, f: impl FnOnce(MappingView<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.lock();
        let Mapping {
            pinned,
            descriptor,
            applied_config,
            ..
        } = &mut *guard;
        let (Some(pinned), Some(descriptor)) = (pinned.as_mut(), descriptor.as_mut()) else {
            return Err(GnaError::NotMapped { id: self.id });
        };

        let mut f = Some(f);
        let mut outcome = None;
        pinned.with_memory(&mut |user| {
            if let Some(f) = f.take() {
                outcome = Some(f(MappingView {
                    user,
                    descriptor: descriptor.as_mut_slice(),
                    applied_config: &mut *applied_config,
                }));
            }
        });
        outcome.unwrap_or_else(|| Err(GnaError::mapping_failure("pinned memory not accessible")))
    }

    fn lock(&self) -> MutexGuard<'_, Mapping> {
        self.mapping.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_page_table(
    platform: &dyn DmaPlatform,
    mapping: &mut Mapping,
    length: usize,
    segments: usize,
) -> Result<()> {
    for index in 0..segments {
        let segment = platform.alloc_common_buffer(PAGE_SIZE).map_err(|e| {
            GnaError::mapping_failure(format!("page-table segment {index}: {e}"))
        })?;
        mapping.page_table.push(segment);
    }

    let pages = length.div_ceil(PAGE_SIZE);
    let sg = mapping
        .pinned
        .as_ref()
        .map(|p| p.scatter_gather().to_vec())
        .unwrap_or_default();
    let numbers = split_into_pages(&sg, pages)?;

    let capacity = segments * PT_ENTRIES_PER_SEGMENT;
    let last = numbers.last().copied().unwrap_or_default();
    for entry in 0..capacity {
        // Entries past the buffer cover engine prefetch; keep them on the last page.
        let value = numbers.get(entry).copied().unwrap_or(last);
        let segment = &mut mapping.page_table[entry / PT_ENTRIES_PER_SEGMENT];
        write_u32(
            segment.as_mut_slice(),
            (entry % PT_ENTRIES_PER_SEGMENT) * PT_ENTRY_SIZE,
            value,
        );
    }

    let mut descriptor = platform
        .alloc_common_buffer(PAGE_SIZE)
        .map_err(|e| GnaError::mapping_failure(format!("descriptor: {e}")))?;

    #[allow(clippy::cast_possible_truncation)]
    let vamaxaddr = (length - 1) as u32;
    let page_directory: Vec<u32> = mapping
        .page_table
        .iter()
        .map(|s| page_number(s.physical_address()))
        .collect();

    let mmu_block = &mut descriptor.as_mut_slice()[descriptor::MMU_CONFIG_OFFSET..];
    write_u32(mmu_block, mmu::VAMAXADDR, vamaxaddr);
    for (slot, number) in page_directory.iter().enumerate() {
        write_u32(mmu_block, mmu::PAGE_DIR + slot * PT_ENTRY_SIZE, *number);
    }

    mapping.descriptor = Some(descriptor);
    mapping.mmu = MmuConfig {
        vamaxaddr,
        page_directory,
    };
    Ok(())
}

/// Page numbers of the first `pages` pages described by `sg`, in order.
/// Runs longer than a page are split into one entry per page.
fn split_into_pages(sg: &[crate::platform::SgElement], pages: usize) -> Result<Vec<u32>> {
    let mut numbers = Vec::with_capacity(pages);
    'runs: for element in sg {
        let mut offset = 0usize;
        while offset < element.length {
            if numbers.len() == pages {
                break 'runs;
            }
            numbers.push(page_number(element.address + offset as u64));
            offset += PAGE_SIZE;
        }
    }
    if numbers.len() < pages {
        return Err(GnaError::mapping_failure(format!(
            "scatter-gather list covers {} pages, need {pages}",
            numbers.len()
        )));
    }
    Ok(numbers)
}

pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
