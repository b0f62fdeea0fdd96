//! PCIe identifiers and hardware generations.

/// Intel vendor ID.
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Device IDs of GNA-equipped platforms.
pub mod device_id {
    /// Gemini Lake.
    pub const GLK: u16 = 0x3190;
    /// Cannon Lake.
    pub const CNL: u16 = 0x5A11;
    /// Ice Lake.
    pub const ICL: u16 = 0x8A11;
    /// Elkhart Lake.
    pub const EHL: u16 = 0x4511;
    /// Jasper Lake.
    pub const JSL: u16 = 0x4E11;
    /// Tiger Lake.
    pub const TGL: u16 = 0x9A11;
    /// Alder Lake.
    pub const ADL: u16 = 0x464F;
    /// Raptor Lake.
    pub const RPL: u16 = 0xA74F;
}

/// All known GNA device IDs.
pub const ALL_DEVICE_IDS: &[u16] = &[
    device_id::GLK,
    device_id::CNL,
    device_id::ICL,
    device_id::EHL,
    device_id::JSL,
    device_id::TGL,
    device_id::ADL,
    device_id::RPL,
];

/// Hardware generation, reported by the `VERSION` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// GNA 1.0.
    Gna1,
    /// GNA 2.0 (adds the active-list and breakpoint features).
    Gna2,
    /// GNA 3.0.
    Gna3,
    /// Unknown / future generation.
    Unknown(u32),
}

impl Generation {
    /// Identify the generation from the `VERSION` register.
    #[must_use]
    pub const fn from_version(raw: u32) -> Self {
        match raw & 0xFF {
            0x10 => Self::Gna1,
            0x20 => Self::Gna2,
            0x30 => Self::Gna3,
            _ => Self::Unknown(raw),
        }
    }
}

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter(device: u16) -> String {
    format!("{INTEL_VENDOR_ID:04x}:{device:04x}")
}
