//! Device capabilities, read once when the hardware is prepared.

use crate::mmio::RegisterInterface;
use gna_chip::pcie::Generation;
use gna_chip::regs;

/// What the device reported about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Hardware generation decoded from `VERSION`
    pub generation: Generation,
    /// Raw `VERSION` register
    pub version: u32,
    /// Raw `FEATURES` bitmap
    pub features: u32,
}

impl Capabilities {
    /// Read `VERSION` and `FEATURES`
    pub fn read(regs: &dyn RegisterInterface) -> Self {
        let version = regs.read32(regs::VERSION);
        Self {
            generation: Generation::from_version(version),
            version,
            features: regs.read32(regs::FEATURES),
        }
    }

    /// `true` when feature bit `bit` is set
    pub const fn has_feature(&self, bit: u32) -> bool {
        bit < 32 && self.features & (1 << bit) != 0
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (version {:#010x}, features {:#010x})",
            self.generation, self.version, self.features
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    #[test]
    fn decodes_generation_and_features() {
        let sim = SimRegisters::new();
        sim.set_identity(0x0000_0020, 0b101);
        let caps = Capabilities::read(&sim);
        assert_eq!(caps.generation, Generation::Gna2);
        assert!(caps.has_feature(0));
        assert!(!caps.has_feature(1));
        assert!(caps.has_feature(2));
        assert!(!caps.has_feature(40));
    }
}
