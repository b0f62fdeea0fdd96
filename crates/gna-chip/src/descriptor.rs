//! Hardware descriptor and MMU page-table geometry.
//!
//! Each mapped buffer owns one descriptor page. The engine fetches it from
//! the physical address programmed into `DESBASE`:
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────────
//!    0    320   XNN configuration
//!             0  u32  layer array base (offset into the mapped buffer)
//!             4  u32  layer count
//!             8  u32  operating mode
//!            12  u32  active-list enable
//!   320   464   MMU configuration
//!             0  u32  vamaxaddr — last valid virtual offset
//!             4   12  reserved
//!            16  u32  × 65 page directory (page numbers of PT segments)
//! ```
//!
//! A page-table segment is one physical page of 1024 little-endian `u32`
//! page numbers. The engine prefetches up to 32 entries past the end of the
//! buffer, so every table carries that margin.

/// Host page size.
pub const PAGE_SIZE: usize = 4096;

/// Bytes per page-table entry.
pub const PT_ENTRY_SIZE: usize = 4;

/// Entries held by one page-table segment.
pub const PT_ENTRIES_PER_SEGMENT: usize = PAGE_SIZE / PT_ENTRY_SIZE;

/// Page directory length.
pub const PT_DIR_SIZE: usize = 64;

/// Maximum number of page-table segments a descriptor can reference.
pub const MAX_PT_SEGMENTS: usize = PT_DIR_SIZE + 1;

/// Extra entries reserved past the buffer for engine prefetch.
pub const PT_PREFETCH_MARGIN: usize = 32;

/// Page counts are padded up to this many entries.
pub const PT_ENTRY_PADDING: usize = 16;

/// Largest buffer one descriptor can map.
pub const MAX_MAP_SIZE: usize = PT_DIR_SIZE * PT_ENTRIES_PER_SEGMENT * PAGE_SIZE;

/// Total descriptor size.
pub const DESCRIPTOR_SIZE: usize = XNN_CONFIG_SIZE + MMU_CONFIG_SIZE;

/// XNN configuration sub-block size.
pub const XNN_CONFIG_SIZE: usize = 320;

/// MMU configuration sub-block size.
pub const MMU_CONFIG_SIZE: usize = 464;

/// Offset of the XNN configuration inside the descriptor.
pub const XNN_CONFIG_OFFSET: usize = 0;

/// Offset of the MMU configuration inside the descriptor.
pub const MMU_CONFIG_OFFSET: usize = XNN_CONFIG_SIZE;

pub mod xnn {
    //! Field offsets inside the XNN configuration.

    /// Layer array base.
    pub const LAYER_BASE: usize = 0;
    /// Layer count.
    pub const LAYER_COUNT: usize = 4;
    /// Operating mode.
    pub const OP_MODE: usize = 8;
    /// Active-list enable.
    pub const ACTIVE_LIST: usize = 12;
}

pub mod mmu {
    //! Field offsets inside the MMU configuration.

    /// Last valid virtual offset.
    pub const VAMAXADDR: usize = 0;
    /// First page-directory entry.
    pub const PAGE_DIR: usize = 16;
}

/// Page-table entries needed to map `len` bytes, prefetch margin included.
#[must_use]
pub const fn required_pt_entries(len: usize) -> usize {
    let pages = len.div_ceil(PAGE_SIZE);
    pages.next_multiple_of(PT_ENTRY_PADDING) + PT_PREFETCH_MARGIN
}

/// Page-table segments needed to hold `entries` entries.
#[must_use]
pub const fn required_pt_segments(entries: usize) -> usize {
    entries.div_ceil(PT_ENTRIES_PER_SEGMENT)
}

/// Page number of a physical address.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn page_number(phys: u64) -> u32 {
    (phys >> 12) as u32
}

#[cfg(test)]
#[allow(clippy::assertions_on_constants)]
mod tests {
    use super::*;

    #[test]
    fn layout_fits_one_page() {
        assert_eq!(DESCRIPTOR_SIZE, 784);
        assert!(DESCRIPTOR_SIZE <= PAGE_SIZE);
        assert!(mmu::PAGE_DIR + MAX_PT_SEGMENTS * 4 <= MMU_CONFIG_SIZE);
        assert!(xnn::ACTIVE_LIST + 4 <= XNN_CONFIG_SIZE);
    }

    #[test]
    fn entry_formula_pads_and_adds_margin() {
        assert_eq!(required_pt_entries(1), 16 + 32);
        assert_eq!(required_pt_entries(PAGE_SIZE * 16), 16 + 32);
        assert_eq!(required_pt_entries(PAGE_SIZE * 17), 32 + 32);
        assert_eq!(required_pt_segments(48), 1);
        assert_eq!(required_pt_segments(1024), 1);
        assert_eq!(required_pt_segments(1025), 2);
    }

    #[test]
    fn largest_mapping_uses_every_segment() {
        let entries = required_pt_entries(MAX_MAP_SIZE);
        assert_eq!(required_pt_segments(entries), MAX_PT_SEGMENTS);
    }

    #[test]
    fn page_numbers_drop_the_offset() {
        assert_eq!(page_number(0x1234_5000), 0x12345);
        assert_eq!(page_number(0x1234_5fff), 0x12345);
    }
}
