//! Configuration resolver — turns a shape and attributes into a kernel config.
//!
//! Pure data transformation: validates the problem, picks register blocking
//! for the target, records tail handling and folds leading post-ops into
//! accumulator initialization. Nothing here emits code.

use log::debug;

use crate::compiler::attr::{validate_post_ops, BoundsMode, ConvAttr, PostOp};
use crate::compiler::codegen::target_desc::TargetDesc;
use crate::compiler::shape::ConvShape;
use crate::types::{ConfigError, DataType};

/// Largest number of output-channel blocks one call processes.
pub const MAX_OC_BLOCKING: usize = 4;

/// Accumulator numeric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumType {
    /// Fused multiply-add in f32.
    F32,
    /// Wrapping i32 multiply-add of widened 8-bit operands.
    S32,
}

/// How the last, partial output-channel block is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailMode {
    None,
    /// Partial-width masked loads/stores covering `remainder` lanes.
    Masked { remainder: usize },
}

/// Numeric conversion between accumulator and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreConversion {
    /// Accumulator lanes stored in their own type (f32 → f32, or s32 → s32
    /// with no store-time ops).
    Raw,
    /// s32 accumulators convert to f32 before post-ops. With `saturate`, the
    /// result is clamped to the destination range, rounded half to even and
    /// narrowed to the integer destination type.
    ViaF32 { saturate: bool },
}

/// Accumulator initialization, folding a leading post-op where exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccInit {
    Zero,
    /// f32 path: accumulators start at the per-channel bias.
    Bias,
    /// s32 path: accumulators start at the negated per-channel compensation.
    NegCompensation,
}

/// Fully resolved convolution kernel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    pub shape: ConvShape,
    pub target: TargetDesc,
    pub oh: usize,
    pub ow: usize,
    /// Output channels per vector (= lanes).
    pub oc_block: usize,
    pub nb_oc: usize,
    /// Output-channel blocks per call (one oc group).
    pub nb_oc_blocking: usize,
    /// Output points per register tile.
    pub ur_w: usize,
    /// Input channels per ic-block loop iteration. Depthwise kernels use one
    /// channel block per oc block and ignore the ic fields.
    pub ic_block: usize,
    pub nb_ic: usize,
    pub ic_tail: usize,
    pub oc_tail: TailMode,
    pub accum: AccumType,
    pub store: StoreConversion,
    pub init: AccInit,
    /// Post-ops as supplied by the caller.
    pub post_ops: Vec<PostOp>,
    /// Post-ops left for the store path after folding.
    pub store_ops: Vec<PostOp>,
    pub bounds: BoundsMode,
}

/// Vector registers the planner needs for a tile of `ur_w × nb` accumulators.
///
/// Scratch and the post-op operand live only outside the accumulation phase,
/// so they always land in the `nb + 1` weight/input registers, which are dead
/// by then. Only the mask is live across all phases.
fn vector_budget(ur_w: usize, nb: usize, mask: bool) -> usize {
    ur_w * nb + nb + 1 /* input */ + mask as usize
}

fn unsupported(msg: impl Into<String>) -> ConfigError {
    ConfigError::Unsupported(msg.into())
}

impl ConvConfig {
    #[inline]
    pub fn simd_width(&self) -> usize {
        self.target.simd_width
    }

    pub fn is_depthwise(&self) -> bool {
        self.shape.is_depthwise()
    }

    /// Number of oc groups (calls per output row).
    pub fn n_oc_groups(&self) -> usize {
        self.nb_oc.div_ceil(self.nb_oc_blocking)
    }

    /// Blocks processed by the last oc group.
    pub fn last_group_blocks(&self) -> usize {
        self.nb_oc - (self.n_oc_groups() - 1) * self.nb_oc_blocking
    }

    pub fn needs_mask(&self) -> bool {
        self.oc_tail != TailMode::None
    }

    pub fn needs_operand(&self) -> bool {
        self.init != AccInit::Zero || self.store_ops.iter().any(PostOp::needs_operand)
    }

    /// Number of independent calls covering the problem: batch × OH × oc groups.
    pub fn work_amount(&self) -> usize {
        self.shape.batch * self.oh * self.n_oc_groups()
    }

    /// Decompose a flat work index into `(n, oh, oc_group)`, oc group fastest.
    pub fn work_item(&self, i: usize) -> (usize, usize, usize) {
        let groups = self.n_oc_groups();
        let g = i % groups;
        let rest = i / groups;
        (rest / self.oh, rest % self.oh, g)
    }

    fn max_ur_w_for(&self, nb: usize) -> usize {
        let fixed = vector_budget(0, nb, self.needs_mask());
        self.target.num_vregs.saturating_sub(fixed) / nb
    }

    /// One `ur_w` reduction: the largest tile width the register budget
    /// admits for the current oc blocking. `None` if nothing smaller fits.
    pub fn reduce_ur_w(&self) -> Option<ConvConfig> {
        let ur = self.max_ur_w_for(self.nb_oc_blocking).min(self.ur_w.saturating_sub(1));
        (ur >= 1).then(|| ConvConfig { ur_w: ur, ..self.clone() })
    }

    /// One oc-blocking reduction to the widest blocking with a fitting tile.
    pub fn reduce_oc_blocking(&self) -> Option<ConvConfig> {
        (1..self.nb_oc_blocking).rev().find_map(|nb| {
            let ur = self.max_ur_w_for(nb).min(self.ur_w);
            (ur >= 1).then(|| ConvConfig { nb_oc_blocking: nb, ur_w: ur, ..self.clone() })
        })
    }

    /// Stable descriptor string for hashing.
    pub(crate) fn descriptor(&self) -> String {
        format!("conv:{self:?}")
    }
}

/// Supported (src, weight, dst) triples and their accumulator kind.
fn accum_type(src: DataType, wei: DataType, dst: DataType) -> Option<AccumType> {
    use DataType::*;
    match (src, wei, dst) {
        (F32, F32, F32) => Some(AccumType::F32),
        (U8 | S8, S8, F32 | S32 | S8 | U8) => Some(AccumType::S32),
        _ => None,
    }
}

/// Resolve a convolution configuration.
pub fn resolve(shape: &ConvShape, attr: &ConvAttr, target: &TargetDesc) -> Result<ConvConfig, ConfigError> {
    target.validate()?;
    let s = shape;
    let extents = [
        ("batch", s.batch),
        ("ic", s.ic),
        ("oc", s.oc),
        ("ih", s.ih),
        ("iw", s.iw),
        ("kh", s.kh),
        ("kw", s.kw),
        ("stride_h", s.stride_h),
        ("stride_w", s.stride_w),
        ("dil_h", s.dil_h),
        ("dil_w", s.dil_w),
    ];
    if let Some((name, _)) = extents.iter().find(|(_, v)| *v == 0) {
        return Err(unsupported(format!("{name} must be non-zero")));
    }
    let (oh, ow) = match (s.checked_oh(), s.checked_ow()) {
        (Some(oh), Some(ow)) => (oh, ow),
        _ => {
            return Err(unsupported(format!(
                "{}x{} kernel (dilation {}x{}) does not fit the padded {}x{} input",
                s.kh, s.kw, s.dil_h, s.dil_w, s.ih, s.iw
            )))
        }
    };
    if s.groups != 1 && !(s.groups == s.ic && s.ic == s.oc) {
        return Err(unsupported(format!(
            "groups = {} with ic = {}, oc = {} (only dense or depthwise)",
            s.groups, s.ic, s.oc
        )));
    }
    let accum = accum_type(s.src_dt, s.wei_dt, s.dst_dt).ok_or_else(|| {
        unsupported(format!("type triple {:?}/{:?}/{:?}", s.src_dt, s.wei_dt, s.dst_dt))
    })?;

    // Static memory offsets are 32-bit.
    let limit = i32::MAX as usize;
    let bytes = [
        ("src", s.src_elems().checked_mul(s.src_dt.size_bytes())),
        ("weights", s.wei_elems().checked_mul(s.wei_dt.size_bytes())),
        ("dst", s.dst_elems().checked_mul(s.dst_dt.size_bytes())),
    ];
    for (name, b) in bytes {
        match b {
            Some(b) if b <= limit => {}
            _ => return Err(unsupported(format!("{name} tensor exceeds 32-bit byte offsets"))),
        }
    }

    validate_post_ops(&attr.post_ops)?;
    if accum == AccumType::F32 && attr.post_ops.contains(&PostOp::Compensation) {
        return Err(unsupported("compensation on the f32 path"));
    }

    let (init, store_ops) = match (accum, attr.post_ops.first()) {
        (AccumType::S32, Some(PostOp::Compensation)) => (AccInit::NegCompensation, attr.post_ops[1..].to_vec()),
        (AccumType::F32, Some(PostOp::Bias)) => (AccInit::Bias, attr.post_ops[1..].to_vec()),
        _ => (AccInit::Zero, attr.post_ops.clone()),
    };
    let store = match accum {
        AccumType::F32 => StoreConversion::Raw,
        AccumType::S32 if store_ops.is_empty() && s.dst_dt == DataType::S32 => StoreConversion::Raw,
        AccumType::S32 => StoreConversion::ViaF32 { saturate: s.dst_dt.is_integer() },
    };

    let lanes = target.simd_width;
    let nb_oc = s.oc.div_ceil(lanes);
    let oc_tail = match s.oc % lanes {
        0 => TailMode::None,
        r => TailMode::Masked { remainder: r },
    };
    let (ic_block, nb_ic, ic_tail) = if s.is_depthwise() {
        (lanes, 1, 0)
    } else {
        (lanes, s.ic / lanes, s.ic % lanes)
    };

    let mut cfg = ConvConfig {
        shape: *s,
        target: *target,
        oh,
        ow,
        oc_block: lanes,
        nb_oc,
        nb_oc_blocking: 1,
        ur_w: 1,
        ic_block,
        nb_ic,
        ic_tail,
        oc_tail,
        accum,
        store,
        init,
        post_ops: attr.post_ops.clone(),
        store_ops,
        bounds: attr.bounds,
    };

    let max_nb = nb_oc.min(MAX_OC_BLOCKING);
    match attr.blocking {
        Some(hint) => {
            if hint.ur_w == 0 || hint.ur_w > ow || hint.nb_oc_blocking == 0 || hint.nb_oc_blocking > max_nb {
                return Err(unsupported(format!(
                    "blocking hint ur_w = {}, nb_oc_blocking = {} (allowed: 1..={ow}, 1..={max_nb})",
                    hint.ur_w, hint.nb_oc_blocking
                )));
            }
            cfg.ur_w = hint.ur_w;
            cfg.nb_oc_blocking = hint.nb_oc_blocking;
        }
        None => {
            let best = (1..=max_nb)
                .filter_map(|nb| {
                    let ur = cfg.max_ur_w_for(nb).min(ow);
                    (ur >= 1).then_some((ur * nb, nb, ur))
                })
                .max_by_key(|&(tile, nb, _)| (tile, nb));
            let Some((_, nb, ur)) = best else {
                return Err(unsupported(format!(
                    "{} vector registers cannot hold a single accumulator tile",
                    target.num_vregs
                )));
            };
            cfg.ur_w = ur;
            cfg.nb_oc_blocking = nb;
        }
    }

    debug!(
        "resolved conv: oc {} in {}x{} blocks (tail {:?}), ur_w {}, ic {}x{} + {}, {:?}, {:?}",
        s.oc, cfg.nb_oc, lanes, cfg.oc_tail, cfg.ur_w, cfg.nb_ic, cfg.ic_block, cfg.ic_tail, cfg.accum, cfg.store
    );
    Ok(cfg)
}
