//! Diagnostic device probing.
//!
//! The tag reported here is informational only: actual tensor placement is
//! decided by the model loader's own automatic mapping. Nothing downstream
//! may branch on this value.

use std::fmt;

/// Compute backend classification, probed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTag {
    Gpu,
    UnifiedMemory,
    Cpu,
}

impl DeviceTag {
    /// Probe the runtime environment: discrete GPU first, then an Apple
    /// unified-memory backend, with CPU as the fallback.
    pub fn detect() -> Self {
        Self::classify(
            candle_core::utils::cuda_is_available(),
            candle_core::utils::metal_is_available(),
        )
    }

    /// Pure classification over probe results, in fixed priority order.
    pub fn classify(gpu: bool, unified_memory: bool) -> Self {
        if gpu {
            Self::Gpu
        } else if unified_memory {
            Self::UnifiedMemory
        } else {
            Self::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::UnifiedMemory => "unified-memory",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_probe_priority() {
        assert_eq!(DeviceTag::classify(true, false), DeviceTag::Gpu);
        assert_eq!(DeviceTag::classify(true, true), DeviceTag::Gpu);
        assert_eq!(DeviceTag::classify(false, true), DeviceTag::UnifiedMemory);
        assert_eq!(DeviceTag::classify(false, false), DeviceTag::Cpu);
    }

    #[test]
    fn display_matches_operator_vocabulary() {
        assert_eq!(DeviceTag::Gpu.to_string(), "gpu");
        assert_eq!(DeviceTag::UnifiedMemory.to_string(), "unified-memory");
        assert_eq!(DeviceTag::Cpu.to_string(), "cpu");
    }
}
