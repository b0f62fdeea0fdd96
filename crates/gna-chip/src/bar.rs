//! PCIe BAR layout.
//!
//! ```text
//! BAR  Size    Type                  Purpose
//! ──── ─────── ───────────────────── ──────────────────────────────────────
//!  0   4 KB    64-bit non-prefetch   Register space (MMIO)
//! ```
//!
//! The driver refuses to bind when BAR0 is any other size: a different
//! window means a different register map.

/// BAR0 — control register space.
pub mod bar0 {
    /// Expected window size in bytes.
    pub const SIZE: usize = 0x1000;
    /// BAR index for VFIO region queries.
    pub const VFIO_INDEX: u32 = 0;
}

/// `true` when `len` is the BAR0 size this register map describes.
#[must_use]
pub const fn is_expected_mmio_len(len: usize) -> bool {
    len == bar0::SIZE
}
