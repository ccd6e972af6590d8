//! Runtime call contract — parameter blocks handed to generated routines.
//!
//! Each routine reads exactly one `#[repr(C)]` block through the parameter
//! register. Field offsets are published by `conv_param_layout()` /
//! `eltwise_param_layout()` for dispatchers that build blocks themselves.
//!
//! Conv routines compute one output row of one image for one oc group:
//! `ConvConfig::call_params` pre-offsets every pointer to that slice and
//! narrows the kernel rows to those overlapping the input.

use std::mem::{offset_of, size_of};
use std::ops::Range;
use std::ptr;

use crate::compiler::attr::BoundsMode;
use crate::compiler::config::ConvConfig;
use crate::compiler::eltwise::{EltwiseAlg, EltwiseConfig, PreluMode};

/// Per-call block of a convolution routine.
///
/// Pointers are pre-offset to the call's slice: `src` to the first kernel row
/// the routine reads (naive mode: the row `ih_start`, which may lie outside
/// the image), `weights` to that kernel row and the group's first output
/// channel, `dst` / `residual` to the output row and channel, and the
/// per-channel arrays to the group's first channel. Unused pointers may be
/// null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConvCallParams {
    pub src: *const u8,
    pub weights: *const u8,
    pub dst: *mut u8,
    /// f32 per output channel
    pub bias: *const u8,
    /// f32 per output channel
    pub scales: *const u8,
    /// i32 per output channel
    pub compensation: *const u8,
    /// dst type and layout
    pub residual: *const u8,
    /// Kernel rows to visit.
    pub kh_padding: usize,
    /// Input row of the first visited kernel row (naive mode range check).
    pub ih_start: isize,
    /// Non-zero when this call covers the last oc group.
    pub last_oc_group: usize,
}

/// Per-call block of an elementwise routine.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EltwiseCallParams {
    pub src: *const u8,
    /// f32 slopes; per-channel mode: the slope row, otherwise pre-offset like `src`.
    pub weights: *const u8,
    pub dst: *mut u8,
    /// Elements (flat modes) or rows (`PerChannel`) to process.
    ///
    /// The masked tail is specialized to `EltwiseConfig::tail` lanes, so in
    /// flat modes `work_amount % lanes` must be 0 or exactly that tail: the
    /// range must start on a vector boundary and end on one or at the end of
    /// the tensor, as `EltwiseConfig::partition` guarantees.
    pub work_amount: usize,
}

/// One field of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamField {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

macro_rules! field {
    ($ty:ty, $name:ident, $fty:ty) => {
        ParamField { name: stringify!($name), offset: offset_of!($ty, $name), size: size_of::<$fty>() }
    };
}

pub fn conv_param_layout() -> [ParamField; 10] {
    [
        field!(ConvCallParams, src, *const u8),
        field!(ConvCallParams, weights, *const u8),
        field!(ConvCallParams, dst, *mut u8),
        field!(ConvCallParams, bias, *const u8),
        field!(ConvCallParams, scales, *const u8),
        field!(ConvCallParams, compensation, *const u8),
        field!(ConvCallParams, residual, *const u8),
        field!(ConvCallParams, kh_padding, usize),
        field!(ConvCallParams, ih_start, isize),
        field!(ConvCallParams, last_oc_group, usize),
    ]
}

pub fn eltwise_param_layout() -> [ParamField; 4] {
    [
        field!(EltwiseCallParams, src, *const u8),
        field!(EltwiseCallParams, weights, *const u8),
        field!(EltwiseCallParams, dst, *mut u8),
        field!(EltwiseCallParams, work_amount, usize),
    ]
}

/// Byte offsets of the parameter fields as immediates for generated loads.
pub(crate) mod offsets {
    use super::*;

    pub const CONV_SRC: i32 = offset_of!(ConvCallParams, src) as i32;
    pub const CONV_WEIGHTS: i32 = offset_of!(ConvCallParams, weights) as i32;
    pub const CONV_DST: i32 = offset_of!(ConvCallParams, dst) as i32;
    pub const CONV_BIAS: i32 = offset_of!(ConvCallParams, bias) as i32;
    pub const CONV_SCALES: i32 = offset_of!(ConvCallParams, scales) as i32;
    pub const CONV_COMPENSATION: i32 = offset_of!(ConvCallParams, compensation) as i32;
    pub const CONV_RESIDUAL: i32 = offset_of!(ConvCallParams, residual) as i32;
    pub const CONV_KH_PADDING: i32 = offset_of!(ConvCallParams, kh_padding) as i32;
    pub const CONV_IH_START: i32 = offset_of!(ConvCallParams, ih_start) as i32;
    pub const CONV_LAST_OC_GROUP: i32 = offset_of!(ConvCallParams, last_oc_group) as i32;

    pub const ELT_SRC: i32 = offset_of!(EltwiseCallParams, src) as i32;
    pub const ELT_WEIGHTS: i32 = offset_of!(EltwiseCallParams, weights) as i32;
    pub const ELT_DST: i32 = offset_of!(EltwiseCallParams, dst) as i32;
    pub const ELT_WORK: i32 = offset_of!(EltwiseCallParams, work_amount) as i32;
}

/// Whole-tensor base pointers of a convolution. Absent operands are null.
#[derive(Debug, Clone, Copy)]
pub struct ConvBuffers {
    pub src: *const u8,
    pub weights: *const u8,
    pub dst: *mut u8,
    pub bias: *const u8,
    pub scales: *const u8,
    pub compensation: *const u8,
    pub residual: *const u8,
}

// SAFETY: ConvBuffers is a bundle of addresses; it never dereferences them.
// Callers that share one across threads hand disjoint output ranges to each
// routine invocation, as the call contract requires.
unsafe impl Send for ConvBuffers {}
unsafe impl Sync for ConvBuffers {}

impl ConvBuffers {
    pub fn new(src: *const u8, weights: *const u8, dst: *mut u8) -> Self {
        ConvBuffers {
            src,
            weights,
            dst,
            bias: ptr::null(),
            scales: ptr::null(),
            compensation: ptr::null(),
            residual: ptr::null(),
        }
    }
}

/// Whole-tensor base pointers of an elementwise primitive.
#[derive(Debug, Clone, Copy)]
pub struct EltwiseBuffers {
    pub src: *const u8,
    pub weights: *const u8,
    pub dst: *mut u8,
}

// SAFETY: see `ConvBuffers`.
unsafe impl Send for EltwiseBuffers {}
unsafe impl Sync for EltwiseBuffers {}

#[inline]
fn offset_ptr(base: *const u8, bytes: isize) -> *const u8 {
    if base.is_null() {
        base
    } else {
        base.wrapping_offset(bytes)
    }
}

impl ConvConfig {
    /// Kernel rows `[first, first + count)` overlapping the input for output
    /// row `oh`.
    pub fn kh_range(&self, oh: usize) -> (usize, usize) {
        let s = &self.shape;
        let ih0 = (oh * s.stride_h) as isize - s.pad_t as isize;
        let valid = |k: usize| {
            let ih = ih0 + (k * s.dil_h) as isize;
            ih >= 0 && ih < s.ih as isize
        };
        match (0..s.kh).position(|k| valid(k)) {
            Some(first) => {
                let count = (first..s.kh).take_while(|&k| valid(k)).count();
                (first, count)
            }
            None => (0, 0),
        }
    }

    /// Parameter block for image `n`, output row `oh`, oc group `group`.
    pub fn call_params(&self, bufs: &ConvBuffers, n: usize, oh: usize, group: usize) -> ConvCallParams {
        let s = &self.shape;
        let (selt, welt, delt) = (s.src_dt.size_bytes(), s.wei_dt.size_bytes(), s.dst_dt.size_bytes());
        let oc0 = group * self.nb_oc_blocking * self.oc_block;
        let ih_start = (oh * s.stride_h) as isize - s.pad_t as isize;
        let (kh_first, kh_padding) = match self.bounds {
            BoundsMode::Narrowed => self.kh_range(oh),
            BoundsMode::Naive => (0, s.kh),
        };
        let ih_first = ih_start + (kh_first * s.dil_h) as isize;
        let src_row = ((n * s.ih) as isize + ih_first) * (s.iw * s.ic * selt) as isize;
        // Depthwise groups read their own input channels.
        let src_chan = if self.is_depthwise() { (oc0 * selt) as isize } else { 0 };
        let wei_row_elems = if self.is_depthwise() { s.kw * s.oc } else { s.kw * s.ic * s.oc };
        let wei_off = ((kh_first * wei_row_elems + oc0) * welt) as isize;
        let dst_off = (((n * self.oh + oh) * self.ow * s.oc + oc0) * delt) as isize;
        ConvCallParams {
            src: offset_ptr(bufs.src, src_row + src_chan),
            weights: offset_ptr(bufs.weights, wei_off),
            dst: offset_ptr(bufs.dst, dst_off) as *mut u8,
            bias: offset_ptr(bufs.bias, (oc0 * 4) as isize),
            scales: offset_ptr(bufs.scales, (oc0 * 4) as isize),
            compensation: offset_ptr(bufs.compensation, (oc0 * 4) as isize),
            residual: offset_ptr(bufs.residual, dst_off),
            kh_padding,
            ih_start,
            last_oc_group: (group + 1 == self.n_oc_groups()) as usize,
        }
    }
}

impl EltwiseConfig {
    /// Parameter block covering `range` of the work space (see `partition`).
    pub fn call_params(&self, bufs: &EltwiseBuffers, range: Range<usize>) -> EltwiseCallParams {
        let d = &self.desc;
        debug_assert!(
            d.is_per_channel() || self.fits_tail(&range),
            "range {range:?} leaves a remainder the {}-lane tail does not cover",
            self.tail
        );
        let (first_elem, wei_off) = if d.is_per_channel() {
            (range.start * d.channels, 0)
        } else {
            let w = match d.alg {
                EltwiseAlg::Prelu(PreluMode::Full) => range.start * 4,
                _ => 0,
            };
            (range.start, w)
        };
        EltwiseCallParams {
            src: offset_ptr(bufs.src, (first_elem * d.src_dt.size_bytes()) as isize),
            weights: offset_ptr(bufs.weights, wei_off as isize),
            dst: offset_ptr(bufs.dst, (first_elem * d.dst_dt.size_bytes()) as isize) as *mut u8,
            work_amount: range.end - range.start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::attr::{Activation, ConvAttr};
    use crate::compiler::eltwise::{resolve_eltwise, EltwiseDesc};
    use crate::compiler::codegen::target_desc::TargetDesc;
    use crate::compiler::config::resolve;
    use crate::compiler::shape::ConvShape;

    #[test]
    fn test_layout_matches_repr_c() {
        let ptr = size_of::<usize>();
        let layout = conv_param_layout();
        for (i, f) in layout.iter().enumerate() {
            assert_eq!(f.offset, i * ptr, "{}", f.name);
            assert_eq!(f.size, ptr);
        }
        assert_eq!(layout[9].name, "last_oc_group");
        assert_eq!(eltwise_param_layout()[3].offset, offsets::ELT_WORK as usize);
    }

    #[test]
    fn test_kh_range_narrows_padded_rows() {
        let s = ConvShape::new(4, 4, (5, 5), (3, 3)).pad(1);
        let cfg = resolve(&s, &ConvAttr::new(), &TargetDesc::avx2()).unwrap();
        assert_eq!(cfg.kh_range(0), (1, 2));
        assert_eq!(cfg.kh_range(2), (0, 3));
        assert_eq!(cfg.kh_range(4), (0, 2));
    }

    #[test]
    fn test_kh_range_all_padding() {
        // Padding wider than the dilated kernel reach leaves rows with no input.
        let s = ConvShape::new(4, 4, (2, 2), (1, 1)).padding(3, 0, 0, 0);
        let cfg = resolve(&s, &ConvAttr::new(), &TargetDesc::avx2()).unwrap();
        assert_eq!(cfg.kh_range(0), (0, 0));
        assert_eq!(cfg.kh_range(3), (0, 1));
    }

    #[test]
    fn test_call_params_offsets() {
        let s = ConvShape::new(4, 20, (5, 5), (3, 3)).pad(1).batch(2);
        let cfg = resolve(&s, &ConvAttr::new().blocking(5, 1), &TargetDesc::avx2()).unwrap();
        let src = vec![0u8; s.src_elems() * 4];
        let wei = vec![0u8; s.wei_elems() * 4];
        let mut dst = vec![0u8; s.dst_elems() * 4];
        let bufs = ConvBuffers::new(src.as_ptr(), wei.as_ptr(), dst.as_mut_ptr());
        let p = cfg.call_params(&bufs, 1, 0, 2);
        // first valid kernel row 1 → input row 0 of image 1
        assert_eq!(p.src as usize - src.as_ptr() as usize, 5 * 5 * 4 * 4);
        assert_eq!(p.weights as usize - wei.as_ptr() as usize, (3 * 4 * 20 + 16) * 4);
        assert_eq!(p.dst as usize - dst.as_ptr() as usize, (25 * 20 + 16) * 4);
        assert_eq!(p.kh_padding, 2);
        assert_eq!(p.ih_start, -1);
        assert_eq!(p.last_oc_group, 1);
        assert!(p.bias.is_null());
    }

    fn flat_cfg() -> EltwiseConfig {
        let d = EltwiseDesc::new(EltwiseAlg::Activation(Activation::Relu { alpha: 0.0 }), 1, 37);
        resolve_eltwise(&d, &TargetDesc::avx2()).unwrap()
    }

    #[test]
    fn test_partitions_respect_fixed_tail() {
        let cfg = flat_cfg();
        assert_eq!(cfg.tail, 5);
        let bufs = EltwiseBuffers { src: std::ptr::null(), weights: std::ptr::null(), dst: std::ptr::null_mut() };
        for nthr in 1..=8 {
            for ithr in 0..nthr {
                let range = cfg.partition(nthr, ithr);
                assert!(cfg.fits_tail(&range), "nthr={nthr} ithr={ithr} {range:?}");
                let p = cfg.call_params(&bufs, range.clone());
                assert!(matches!(p.work_amount % 8, 0 | 5));
            }
        }
        assert!(!cfg.fits_tail(&(0..12)));
        assert!(!cfg.fits_tail(&(3..11)));
        assert!(cfg.fits_tail(&(8..37)));
        assert!(cfg.fits_tail(&(37..37)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "tail does not cover")]
    fn test_unaligned_range_rejected_in_debug() {
        let cfg = flat_cfg();
        let bufs = EltwiseBuffers { src: std::ptr::null(), weights: std::ptr::null(), dst: std::ptr::null_mut() };
        let _ = cfg.call_params(&bufs, 0..12);
    }
}
