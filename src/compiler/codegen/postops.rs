//! Post-op injector — fused store-time operations on one accumulator.
//!
//! Ops apply in caller order and write back into the accumulator. Constants
//! go through the scratch register; memory operands are loaded just in time
//! into the operand register from the base pointers of the call parameter
//! block, masked on tail blocks.

use super::simd_ops::{Gpr, MemOperand, SimdOps, VReg};
use crate::compiler::attr::{Activation, PostOp, ScaleMode};
use crate::compiler::call_params::offsets;
use crate::types::DataType;

/// x = act(x). `tmp` is clobbered by `Relu`.
pub fn emit_activation<A: SimdOps>(asm: &mut A, act: Activation, x: VReg, scratch: VReg, tmp: Option<VReg>) {
    match act {
        Activation::Relu { alpha } => {
            let tmp = tmp.unwrap_or_else(|| panic!("relu lowering needs a temporary register"));
            asm.vbroadcast_const(scratch, alpha);
            asm.vmul(tmp, x, scratch);
            asm.vselect_pos(x, x, x, tmp);
        }
        Activation::Clip { lo, hi } => {
            asm.vbroadcast_const(scratch, lo);
            asm.vmax(x, x, scratch);
            asm.vbroadcast_const(scratch, hi);
            asm.vmin(x, x, scratch);
        }
        Activation::Linear { alpha, beta } => {
            asm.vbroadcast_const(scratch, alpha);
            asm.vmul(x, x, scratch);
            asm.vbroadcast_const(scratch, beta);
            asm.vadd(x, x, scratch);
        }
    }
}

/// Clamp f32 lanes to the range of integer `dt`, then convert to i32 rounding
/// half to even. No-op for f32.
pub fn emit_saturate<A: SimdOps>(asm: &mut A, x: VReg, scratch: VReg, dt: DataType) {
    if let Some((lo, hi)) = dt.saturation_bounds() {
        asm.vbroadcast_const(scratch, lo);
        asm.vmax(x, x, scratch);
        asm.vbroadcast_const(scratch, hi);
        asm.vmin(x, x, scratch);
        asm.vcvt_f32_i32(x, x);
    }
}

/// Parameter-block pointer currently loaded in the temporary register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Base {
    Bias,
    Scales,
    Compensation,
    Residual,
    Dst,
}

impl Base {
    fn param_offset(self) -> i32 {
        match self {
            Base::Bias => offsets::CONV_BIAS,
            Base::Scales => offsets::CONV_SCALES,
            Base::Compensation => offsets::CONV_COMPENSATION,
            Base::Residual => offsets::CONV_RESIDUAL,
            Base::Dst => offsets::CONV_DST,
        }
    }

    /// Row-relative bases are advanced by the current column-block offset.
    fn row_relative(self) -> bool {
        matches!(self, Base::Residual | Base::Dst)
    }
}

/// Registers and offsets the injector works with for one column block.
pub(crate) struct PostOpCtx {
    pub params: Gpr,
    pub out_off: Gpr,
    pub tmp: Gpr,
    pub scratch: VReg,
    pub operand: Option<VReg>,
    pub dst_dt: DataType,
    holds: Option<Base>,
}

impl PostOpCtx {
    pub fn new(params: Gpr, out_off: Gpr, tmp: Gpr, scratch: VReg, operand: Option<VReg>, dst_dt: DataType) -> Self {
        PostOpCtx { params, out_off, tmp, scratch, operand, dst_dt, holds: None }
    }

    /// Forget the cached base (call whenever `out_off` changes).
    pub fn invalidate(&mut self) {
        self.holds = None;
    }

    /// Load `base` into the temporary register unless it is already there.
    pub fn base<A: SimdOps>(&mut self, asm: &mut A, base: Base) -> Gpr {
        if self.holds != Some(base) {
            asm.gpr_load(self.tmp, MemOperand::new(self.params, base.param_offset()));
            if base.row_relative() {
                asm.gpr_add(self.tmp, self.out_off);
            }
            self.holds = Some(base);
        }
        self.tmp
    }

    fn operand(&self) -> VReg {
        self.operand.unwrap_or_else(|| panic!("post-op operand register not planned"))
    }
}

/// Position of one accumulator inside the output slice.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccSite {
    /// Byte offset into per-channel f32 / i32 arrays.
    pub chan_off: i32,
    /// Byte offset into the dst-typed row slice.
    pub row_off: i32,
    pub mask: Option<VReg>,
}

/// Apply `ops` to the f32 accumulator `acc`.
pub(crate) fn inject<A: SimdOps>(asm: &mut A, ops: &[PostOp], acc: VReg, site: AccSite, ctx: &mut PostOpCtx) {
    for op in ops {
        match *op {
            PostOp::Scale(ScaleMode::PerTensor(s)) => {
                asm.vbroadcast_const(ctx.scratch, s);
                asm.vmul(acc, acc, ctx.scratch);
            }
            PostOp::Scale(ScaleMode::PerChannel) => {
                let opnd = ctx.operand();
                let base = ctx.base(asm, Base::Scales);
                asm.vload(opnd, MemOperand::new(base, site.chan_off), DataType::F32, site.mask);
                asm.vmul(acc, acc, opnd);
            }
            PostOp::Bias => {
                let opnd = ctx.operand();
                let base = ctx.base(asm, Base::Bias);
                asm.vload(opnd, MemOperand::new(base, site.chan_off), DataType::F32, site.mask);
                asm.vadd(acc, acc, opnd);
            }
            PostOp::Compensation => {
                let opnd = ctx.operand();
                let base = ctx.base(asm, Base::Compensation);
                asm.vload(opnd, MemOperand::new(base, site.chan_off), DataType::S32, site.mask);
                asm.vcvt_i32_f32(opnd, opnd);
                asm.vsub(acc, acc, opnd);
            }
            PostOp::Activation(act) => emit_activation(asm, act, acc, ctx.scratch, ctx.operand),
            PostOp::Sum { scale } => {
                let opnd = ctx.operand();
                let base = ctx.base(asm, Base::Residual);
                asm.vload(opnd, MemOperand::new(base, site.row_off), ctx.dst_dt, site.mask);
                if ctx.dst_dt.is_integer() {
                    asm.vcvt_i32_f32(opnd, opnd);
                }
                if scale != 1.0 {
                    asm.vbroadcast_const(ctx.scratch, scale);
                    asm.vmul(opnd, opnd, ctx.scratch);
                }
                asm.vadd(acc, acc, opnd);
            }
        }
    }
}
