//! Elementwise kernel family — PReLU and standalone activations.
//!
//! Data is a dense `rows × channels` tensor. Computation happens in f32:
//! integer sources are widened and converted, integer destinations are
//! clamped, rounded half to even and narrowed.
//!
//! Flat modes (`PerTensor`, `Full`, activations) stream `work_amount`
//! elements per call; `PerChannel` walks `work_amount` whole rows so each
//! channel block meets its own slope vector.

use std::ops::Range;

use log::debug;

use crate::compiler::attr::Activation;
use crate::compiler::codegen::target_desc::TargetDesc;
use crate::compiler::parallel::balance211;
use crate::types::{ConfigError, DataType};

/// Largest number of vectors processed per loop iteration.
pub const MAX_UNROLL: usize = 4;

/// Broadcast pattern of PReLU slopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreluMode {
    /// One slope for the whole tensor.
    PerTensor,
    /// One slope per channel, shared by every row.
    PerChannel,
    /// One slope per element.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseAlg {
    /// `x > 0 ? x : x * w` with slopes `w` (f32) from the weights buffer.
    Prelu(PreluMode),
    Activation(Activation),
}

/// Problem description of an elementwise primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EltwiseDesc {
    pub alg: EltwiseAlg,
    pub rows: usize,
    pub channels: usize,
    pub src_dt: DataType,
    pub dst_dt: DataType,
}

impl EltwiseDesc {
    pub fn new(alg: EltwiseAlg, rows: usize, channels: usize) -> Self {
        EltwiseDesc { alg, rows, channels, src_dt: DataType::F32, dst_dt: DataType::F32 }
    }

    pub fn types(mut self, src: DataType, dst: DataType) -> Self {
        self.src_dt = src;
        self.dst_dt = dst;
        self
    }

    pub fn elems(&self) -> usize {
        self.rows * self.channels
    }

    /// Number of f32 slopes the weights buffer must hold.
    pub fn weight_elems(&self) -> usize {
        match self.alg {
            EltwiseAlg::Prelu(PreluMode::PerTensor) => 1,
            EltwiseAlg::Prelu(PreluMode::PerChannel) => self.channels,
            EltwiseAlg::Prelu(PreluMode::Full) => self.elems(),
            EltwiseAlg::Activation(_) => 0,
        }
    }

    /// Whether the routine walks rows rather than a flat element range.
    pub fn is_per_channel(&self) -> bool {
        matches!(self.alg, EltwiseAlg::Prelu(PreluMode::PerChannel))
    }
}

/// Resolved elementwise kernel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseConfig {
    pub desc: EltwiseDesc,
    pub target: TargetDesc,
    /// Vectors per unrolled loop iteration.
    pub unroll: usize,
    /// Lanes in the final masked vector (0 = none): `channels % lanes` per row
    /// for `PerChannel`, `elems % lanes` otherwise.
    pub tail: usize,
}

impl EltwiseConfig {
    #[inline]
    pub fn simd_width(&self) -> usize {
        self.target.simd_width
    }

    pub fn needs_mask(&self) -> bool {
        self.tail != 0
    }

    /// Size of the work space: rows for `PerChannel`, elements otherwise.
    pub fn work_amount(&self) -> usize {
        if self.desc.is_per_channel() {
            self.desc.rows
        } else {
            self.desc.elems()
        }
    }

    /// Worker `ithr`'s share of the work space. Flat ranges start on vector
    /// boundaries so only the partition ending at the tensor end has a tail.
    pub fn partition(&self, nthr: usize, ithr: usize) -> Range<usize> {
        if self.desc.is_per_channel() {
            return balance211(self.desc.rows, nthr, ithr);
        }
        let lanes = self.simd_width();
        let total = self.desc.elems();
        let vectors = balance211(total.div_ceil(lanes), nthr, ithr);
        (vectors.start * lanes).min(total)..(vectors.end * lanes).min(total)
    }

    /// Whether a flat `range` can run on this routine: it starts on a vector
    /// boundary and leaves no remainder or exactly the `tail` lanes. Empty
    /// ranges always fit.
    pub fn fits_tail(&self, range: &Range<usize>) -> bool {
        let lanes = self.simd_width();
        let rem = range.len() % lanes;
        range.is_empty() || (range.start % lanes == 0 && (rem == 0 || rem == self.tail))
    }

    pub(crate) fn descriptor(&self) -> String {
        format!("eltwise:{self:?}")
    }
}

fn vector_budget(unroll: usize, operand: bool, mask: bool) -> usize {
    2 * unroll + 1 /* scratch */ + operand as usize + mask as usize
}

/// Resolve an elementwise configuration.
pub fn resolve_eltwise(desc: &EltwiseDesc, target: &TargetDesc) -> Result<EltwiseConfig, ConfigError> {
    target.validate()?;
    if desc.rows == 0 || desc.channels == 0 {
        return Err(ConfigError::Unsupported(format!(
            "empty {}x{} elementwise tensor",
            desc.rows, desc.channels
        )));
    }
    let limit = i32::MAX as usize;
    let too_big = [desc.src_dt, desc.dst_dt, DataType::F32]
        .iter()
        .any(|dt| desc.elems().checked_mul(dt.size_bytes()).map_or(true, |b| b > limit));
    if too_big {
        return Err(ConfigError::Unsupported("elementwise tensor exceeds 32-bit byte offsets".into()));
    }

    let lanes = target.simd_width;
    let tail = if desc.is_per_channel() { desc.channels % lanes } else { desc.elems() % lanes };
    let operand = matches!(desc.alg, EltwiseAlg::Prelu(PreluMode::PerTensor));
    let fits = |u: usize| vector_budget(u, operand, tail != 0) <= target.num_vregs;
    let Some(unroll) = (1..=MAX_UNROLL).rev().find(|&u| fits(u)) else {
        return Err(ConfigError::Unsupported(format!(
            "{} vector registers cannot hold one elementwise vector",
            target.num_vregs
        )));
    };

    debug!("resolved eltwise {:?}: unroll {}, tail {}", desc.alg, unroll, tail);
    Ok(EltwiseConfig { desc: *desc, target: *target, unroll, tail })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_tail_and_unroll() {
        let d = EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::Full), 3, 7);
        let cfg = resolve_eltwise(&d, &TargetDesc::avx2()).unwrap();
        assert_eq!(cfg.tail, 21 % 8);
        assert_eq!(cfg.unroll, MAX_UNROLL);
        assert_eq!(cfg.work_amount(), 21);
    }

    #[test]
    fn test_per_channel_tail_is_per_row() {
        let d = EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::PerChannel), 5, 19);
        let cfg = resolve_eltwise(&d, &TargetDesc::avx2()).unwrap();
        assert_eq!(cfg.tail, 3);
        assert_eq!(cfg.work_amount(), 5);
        assert_eq!(cfg.partition(2, 1), 3..5);
    }

    #[test]
    fn test_small_register_file_lowers_unroll() {
        let d = EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::PerTensor), 1, 13);
        let t = TargetDesc { num_vregs: 7, ..TargetDesc::sse41() };
        // 2u + scratch + operand + mask <= 7 → u = 2
        assert_eq!(resolve_eltwise(&d, &t).unwrap().unroll, 2);
        let t = TargetDesc { num_vregs: 3, ..TargetDesc::sse41() };
        assert!(resolve_eltwise(&d, &t).is_err());
    }

    #[test]
    fn test_flat_partitions_are_vector_aligned() {
        let d = EltwiseDesc::new(EltwiseAlg::Activation(Activation::Relu { alpha: 0.0 }), 1, 37);
        let cfg = resolve_eltwise(&d, &TargetDesc::avx2()).unwrap();
        let parts: Vec<_> = (0..3).map(|i| cfg.partition(3, i)).collect();
        assert_eq!(parts, vec![0..16, 16..32, 32..37]);
        for p in &parts[..2] {
            assert_eq!(p.start % 8, 0);
            assert_eq!(p.len() % 8, 0);
        }
    }

    #[test]
    fn test_empty_rejected() {
        let d = EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::Full), 0, 4);
        assert!(resolve_eltwise(&d, &TargetDesc::avx2()).is_err());
    }
}
