//! BAR0 register map.
//!
//! All registers are 32 bits wide and naturally aligned. Offsets are from
//! the start of BAR0.
//!
//! ```text
//! 0x80  STS      status (write-1-to-clear for sticky bits)
//! 0x84  CTRL     control
//! 0x88  MCTL     MMU control
//! 0x8C  PTC      performance: total cycles of the last score
//! 0x90  PSC      performance: stall cycles of the last score
//! 0xA8  D0I3C    D0i3 (device-internal low power) control
//! 0xB0  DESBASE  descriptor base, physical page number
//! 0xB4  IBUFFS   input buffer size
//! 0xB8  BPLAYER  breakpoint layer index
//! 0xBC  BPCTRL   breakpoint control
//! 0xE0  VERSION  hardware generation
//! 0xE4  FEATURES feature bitmap
//! ```

// ── Status and control ───────────────────────────────────────────────────────

/// Status register.
pub const STS: usize = 0x80;

/// Control register.
pub const CTRL: usize = 0x84;

/// MMU control register.
pub const MCTL: usize = 0x88;

// ── Performance counters ─────────────────────────────────────────────────────

/// Total cycles spent on the last score.
pub const PTC: usize = 0x8C;

/// Stall cycles observed during the last score.
pub const PSC: usize = 0x90;

// ── Power ────────────────────────────────────────────────────────────────────

/// D0i3 control register.
pub const D0I3C: usize = 0xA8;

// ── Execution setup ──────────────────────────────────────────────────────────

/// Descriptor base. Holds the physical page number of the descriptor page.
pub const DESBASE: usize = 0xB0;

/// Input buffer size, programmed once when the hardware is prepared.
pub const IBUFFS: usize = 0xB4;

/// Breakpoint layer index.
pub const BPLAYER: usize = 0xB8;

/// Breakpoint control.
pub const BPCTRL: usize = 0xBC;

// ── Identification ───────────────────────────────────────────────────────────

/// Hardware generation register.
pub const VERSION: usize = 0xE0;

/// Feature bitmap register.
pub const FEATURES: usize = 0xE4;

// ── Status register bit definitions ──────────────────────────────────────────

pub mod status {
    //! `STS` bits.

    /// Score completed.
    pub const COMPLETED: u32 = 1 << 0;
    /// Engine is processing.
    pub const ACTIVE: u32 = 1 << 1;
    /// Engine is paused.
    pub const PAUSED: u32 = 1 << 2;
    /// Performance counters hold valid values.
    pub const STATISTICS_VALID: u32 = 1 << 3;
    /// MMU request error.
    pub const MMU_ERR: u32 = 1 << 4;
    /// DMA request error.
    pub const DMA_ERR: u32 = 1 << 5;
    /// Unexpected completion on the PCIe link.
    pub const UNEXPECTED_COMPLETION: u32 = 1 << 6;
    /// Virtual address outside the mapped range.
    pub const VA_OOR: u32 = 1 << 7;
    /// Layer parameter out of range.
    pub const PARAM_OOR: u32 = 1 << 8;
    /// Paused on a breakpoint layer.
    pub const BP_PAUSE: u32 = 1 << 9;
    /// Output buffer full.
    pub const OUTBUF_FULL: u32 = 1 << 16;
    /// At least one output saturated.
    pub const SATURATED: u32 = 1 << 17;

    /// Every error bit, highest priority first.
    pub const ERRORS: [u32; 5] = [MMU_ERR, DMA_ERR, UNEXPECTED_COMPLETION, VA_OOR, PARAM_OOR];
    /// All error bits.
    pub const ERROR_MASK: u32 = MMU_ERR | DMA_ERR | UNEXPECTED_COMPLETION | VA_OOR | PARAM_OOR;
}

// ── Control register bit definitions ─────────────────────────────────────────

pub mod control {
    //! `CTRL` bits.

    /// Start scoring.
    pub const START: u32 = 1 << 0;
    /// Enable active-list processing.
    pub const ACTIVE_LIST_EN: u32 = 1 << 1;
    /// Abort the current score and clear engine state. Self-clearing.
    pub const ABORT_CLEAR: u32 = 1 << 2;
    /// Operating mode field shift.
    pub const OP_MODE_SHIFT: u32 = 5;
    /// Operating mode field mask (bits 5..6).
    pub const OP_MODE_MASK: u32 = 0b11 << OP_MODE_SHIFT;
    /// Completion interrupt enable.
    pub const COMP_INT_EN: u32 = 1 << 8;
    /// Breakpoint-pause interrupt enable.
    pub const BP_PAUSE_INT_EN: u32 = 1 << 9;
    /// Error interrupt enable.
    pub const ERR_INT_EN: u32 = 1 << 10;
    /// Statistics level field shift.
    pub const STATS_SHIFT: u32 = 12;
    /// Statistics level field mask (bits 12..15).
    pub const STATS_MASK: u32 = 0xF << STATS_SHIFT;

    /// Encode an operating mode into the control field.
    #[must_use]
    pub const fn op_mode(mode: u32) -> u32 {
        (mode << OP_MODE_SHIFT) & OP_MODE_MASK
    }

    /// Encode a statistics level into the control field.
    #[must_use]
    pub const fn stats(level: u32) -> u32 {
        (level << STATS_SHIFT) & STATS_MASK
    }
}

// ── D0i3 control bit definitions ─────────────────────────────────────────────

pub mod d0i3 {
    //! `D0I3C` bits.

    /// A power command is in progress.
    pub const CIP: u32 = 1 << 0;
    /// Target / current D0i3 state.
    pub const D0I3: u32 = 1 << 2;
}

// ── Breakpoint control bit definitions ───────────────────────────────────────

pub mod breakpoint {
    //! `BPCTRL` bits.

    /// Breakpoint armed.
    pub const ENABLE: u32 = 1 << 0;
}
