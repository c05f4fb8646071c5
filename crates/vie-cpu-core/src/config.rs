use vie_x86::CpuVendor;

use crate::error::ConfigError;

/// Static parameters of an [`crate::Emulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EmulatorConfig {
    /// Decode with this vendor's quirks.
    pub vendor: CpuVendor,
    /// Guest physical address width (MAXPHYADDR); bits above it in paging
    /// entries are reserved.
    pub max_phys_bits: u8,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            vendor: CpuVendor::Intel,
            max_phys_bits: 52,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(32..=52).contains(&self.max_phys_bits) {
            return Err(ConfigError::MaxPhysBits(self.max_phys_bits));
        }
        Ok(())
    }
}
