//! Kernel attributes — fused post-ops, blocking hints and bounds lowering.
//!
//! Post-ops run on each accumulator at store time, in the order the caller
//! lists them. Operand-carrying ops read per-output-channel (or residual)
//! data through the call parameter block.

use crate::types::ConfigError;

/// Multiplier applied by `PostOp::Scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleMode {
    /// One factor for the whole tensor, baked into the routine.
    PerTensor(f32),
    /// One f32 factor per output channel, read from `scales`.
    PerChannel,
}

/// Elementwise activation function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// `x > 0 ? x : x * alpha` (alpha = 0 is plain ReLU).
    Relu { alpha: f32 },
    /// `min(max(x, lo), hi)`
    Clip { lo: f32, hi: f32 },
    /// `x * alpha + beta`, two roundings.
    Linear { alpha: f32, beta: f32 },
}

impl Activation {
    /// Scalar form, matching the generated lane arithmetic bit for bit.
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::Relu { alpha } => {
                let neg = x * alpha;
                if x > 0.0 { x } else { neg }
            }
            Activation::Clip { lo, hi } => x.max(lo).min(hi),
            Activation::Linear { alpha, beta } => x * alpha + beta,
        }
    }

    /// Whether lowering needs a second vector register besides the constant.
    pub(crate) fn needs_temp(&self) -> bool {
        matches!(self, Activation::Relu { .. })
    }
}

/// One fused store-time operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    Scale(ScaleMode),
    /// Add one f32 per output channel, read from `bias`.
    Bias,
    /// Subtract one i32 per output channel, read from `compensation`.
    Compensation,
    Activation(Activation),
    /// `acc + residual * scale`; the residual has the dst type and layout.
    Sum { scale: f32 },
}

impl PostOp {
    /// Whether the op reads operand data through the call parameter block.
    pub fn reads_memory(&self) -> bool {
        matches!(
            self,
            PostOp::Scale(ScaleMode::PerChannel) | PostOp::Bias | PostOp::Compensation | PostOp::Sum { .. }
        )
    }

    /// Whether lowering needs the operand register.
    pub(crate) fn needs_operand(&self) -> bool {
        match self {
            PostOp::Activation(act) => act.needs_temp(),
            op => op.reads_memory(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PostOp::Scale(_) => "scale",
            PostOp::Bias => "bias",
            PostOp::Compensation => "compensation",
            PostOp::Activation(_) => "activation",
            PostOp::Sum { .. } => "sum",
        }
    }
}

/// Caller-requested register blocking, validated by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockingHint {
    /// Output points per register tile.
    pub ur_w: usize,
    /// Output-channel blocks per call.
    pub nb_oc_blocking: usize,
}

/// How padded kernel positions are excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BoundsMode {
    /// Loop bounds narrowed at generation time; interior columns run in a
    /// runtime loop with the full kernel width.
    #[default]
    Narrowed,
    /// Every kernel row visited with a runtime range check and every column
    /// block unrolled with explicit per-position skips.
    Naive,
}

/// Attribute set of a convolution primitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvAttr {
    pub post_ops: Vec<PostOp>,
    pub blocking: Option<BlockingHint>,
    pub bounds: BoundsMode,
}

impl ConvAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a post-op.
    pub fn post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn blocking(mut self, ur_w: usize, nb_oc_blocking: usize) -> Self {
        self.blocking = Some(BlockingHint { ur_w, nb_oc_blocking });
        self
    }

    pub fn bounds(mut self, mode: BoundsMode) -> Self {
        self.bounds = mode;
        self
    }
}

/// Check the ordering rules of a post-op chain.
///
/// Compensation corrects the raw integer accumulator, so it may appear at most
/// once and never after an op that rescales, clamps or mixes in another
/// tensor. The residual sum may appear at most once.
pub fn validate_post_ops(ops: &[PostOp]) -> Result<(), ConfigError> {
    let mut seen_comp = false;
    let mut seen_sum = false;
    let mut transformed: Option<&'static str> = None;
    for (i, op) in ops.iter().enumerate() {
        match op {
            PostOp::Compensation => {
                if seen_comp {
                    return Err(ConfigError::InvalidPostOpOrder(format!(
                        "compensation repeated at position {i}"
                    )));
                }
                if let Some(prev) = transformed {
                    return Err(ConfigError::InvalidPostOpOrder(format!(
                        "compensation at position {i} follows {prev}, which needs the uncompensated accumulator first"
                    )));
                }
                seen_comp = true;
            }
            PostOp::Sum { .. } => {
                if seen_sum {
                    return Err(ConfigError::InvalidPostOpOrder(format!(
                        "residual sum repeated at position {i}"
                    )));
                }
                seen_sum = true;
                transformed = Some(op.name());
            }
            PostOp::Scale(_) | PostOp::Activation(_) => transformed = Some(op.name()),
            PostOp::Bias => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_chains() {
        let ops = [
            PostOp::Compensation,
            PostOp::Scale(ScaleMode::PerChannel),
            PostOp::Bias,
            PostOp::Activation(Activation::Relu { alpha: 0.0 }),
            PostOp::Sum { scale: 1.0 },
        ];
        validate_post_ops(&ops).unwrap();
        validate_post_ops(&[PostOp::Bias, PostOp::Compensation]).unwrap();
        validate_post_ops(&[]).unwrap();
    }

    #[test]
    fn test_compensation_after_scale_rejected() {
        let ops = [PostOp::Scale(ScaleMode::PerTensor(0.5)), PostOp::Compensation];
        let err = validate_post_ops(&ops).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPostOpOrder(ref m) if m.contains("scale")));
    }

    #[test]
    fn test_repeated_ops_rejected() {
        assert!(validate_post_ops(&[PostOp::Compensation, PostOp::Compensation]).is_err());
        let sum = PostOp::Sum { scale: 1.0 };
        assert!(validate_post_ops(&[sum, sum]).is_err());
        let act = PostOp::Activation(Activation::Clip { lo: 0.0, hi: 6.0 });
        assert!(validate_post_ops(&[sum, act, PostOp::Compensation]).is_err());
    }

    #[test]
    fn test_activation_scalar_forms() {
        let relu = Activation::Relu { alpha: 0.1 };
        assert_eq!(relu.apply(2.0), 2.0);
        assert_eq!(relu.apply(-2.0), -2.0 * 0.1);
        let clip = Activation::Clip { lo: 0.0, hi: 6.0 };
        assert_eq!(clip.apply(7.5), 6.0);
        assert_eq!(clip.apply(-1.0), 0.0);
        assert_eq!(clip.apply(f32::NAN), 0.0);
        let lin = Activation::Linear { alpha: 2.0, beta: 1.0 };
        assert_eq!(lin.apply(3.0), 7.0);
    }

    #[test]
    fn test_operand_needs() {
        assert!(PostOp::Bias.needs_operand());
        assert!(!PostOp::Scale(ScaleMode::PerTensor(2.0)).needs_operand());
        assert!(PostOp::Activation(Activation::Relu { alpha: 0.0 }).needs_operand());
        assert!(!PostOp::Activation(Activation::Clip { lo: 0.0, hi: 1.0 }).needs_operand());
    }
}
