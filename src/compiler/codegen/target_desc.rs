//! Target descriptor — the capability-layer input to the resolver and planner.
//!
//! Captures vector width and register-file sizes. Swapping the descriptor is
//! how a kernel is retargeted to a narrower or wider instruction-set mode; the
//! resolver, planner and generators read only these fields.

use crate::types::ConfigError;

/// Widest vector supported by the executor (32-bit lanes).
pub const MAX_LANES: usize = 16;
/// Largest vector register file supported by the executor.
pub const MAX_VREGS: usize = 32;
/// Largest general-purpose register file supported by the executor.
pub const MAX_GPRS: usize = 16;

/// ISA level presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsaLevel {
    Sse41,
    Avx2,
    Avx512,
    Neon,
}

/// Platform-independent description of the target's vector capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDesc {
    /// Number of 32-bit lanes per vector register (4=SSE/NEON, 8=AVX2, 16=AVX-512).
    pub simd_width: usize,
    /// Total number of vector registers (16=SSE/AVX2, 32=NEON/AVX-512).
    pub num_vregs: usize,
    /// Total number of general-purpose registers available to a routine.
    pub num_gprs: usize,
}

impl TargetDesc {
    pub const fn sse41() -> Self {
        TargetDesc { simd_width: 4, num_vregs: 16, num_gprs: 16 }
    }

    pub const fn avx2() -> Self {
        TargetDesc { simd_width: 8, num_vregs: 16, num_gprs: 16 }
    }

    pub const fn avx512() -> Self {
        TargetDesc { simd_width: 16, num_vregs: 32, num_gprs: 16 }
    }

    pub const fn neon() -> Self {
        TargetDesc { simd_width: 4, num_vregs: 32, num_gprs: 16 }
    }

    pub const fn for_isa(isa: IsaLevel) -> Self {
        match isa {
            IsaLevel::Sse41 => Self::sse41(),
            IsaLevel::Avx2 => Self::avx2(),
            IsaLevel::Avx512 => Self::avx512(),
            IsaLevel::Neon => Self::neon(),
        }
    }

    /// SIMD register width in bytes.
    #[inline]
    pub fn simd_bytes(&self) -> usize {
        self.simd_width * 4
    }

    /// Reject descriptors the executor cannot model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.simd_width, 4 | 8 | 16) {
            return Err(ConfigError::Unsupported(format!(
                "vector width of {} lanes has no matching register class",
                self.simd_width
            )));
        }
        if self.num_vregs == 0 || self.num_vregs > MAX_VREGS {
            return Err(ConfigError::Unsupported(format!(
                "{} vector registers (supported: 1..={MAX_VREGS})",
                self.num_vregs
            )));
        }
        if self.num_gprs == 0 || self.num_gprs > MAX_GPRS {
            return Err(ConfigError::Unsupported(format!(
                "{} general registers (supported: 1..={MAX_GPRS})",
                self.num_gprs
            )));
        }
        Ok(())
    }
}

impl Default for TargetDesc {
    fn default() -> Self {
        Self::avx2()
    }
}
