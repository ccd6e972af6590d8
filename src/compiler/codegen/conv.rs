//! Convolution row kernel generator.
//!
//! One routine call computes one output row of one image for one oc group
//! (`nb_oc_blocking` output-channel blocks). Code layout:
//!
//! ```text
//! entry:  last_oc_group != 0 → last path
//! full:   columns → ret
//! last:   set tail mask; columns with fewer blocks / masked tail → ret
//!
//! columns (per path):
//!   left-padded tiles   static, per-position kw narrowing
//!   interior tiles      runtime loop, full kw range
//!   right/ur-tail tiles static, per-position kw narrowing
//!
//! tile:   init → icb loop { kh loop { kw × ic unrolled } } → ic tail → store
//! ```
//!
//! Kernel rows arrive pre-narrowed through `kh_padding` (see
//! `ConvConfig::call_params`). In `BoundsMode::Naive` every tile is static
//! and every kernel row is visited with a runtime `0 <= ih < IH` check.
//! Both lowerings issue the same multiply-adds in the same order.

use log::trace;

use super::assembler::Assembler;
use super::insn::encode;
use super::postops::{emit_saturate, inject, AccSite, Base, PostOpCtx};
use super::simd_ops::{Gpr, MemOperand, SimdOps, VReg};
use super::CodegenOutput;
use crate::compiler::attr::BoundsMode;
use crate::compiler::call_params::offsets;
use crate::compiler::config::{AccInit, AccumType, ConvConfig, StoreConversion, TailMode};
use crate::compiler::executable::{config_hash, Routine};
use crate::compiler::planner::{GRole, RegisterAssignment, VRole};
use crate::types::DataType;

/// Static in-routine byte offset. The resolver bounds every tensor to 32-bit
/// byte extents, so offsets inside one tensor always fit.
#[inline]
fn off(bytes: usize) -> i32 {
    debug_assert!(bytes <= i32::MAX as usize, "offset {bytes} exceeds 32 bits");
    bytes as i32
}

/// Output-channel shape of one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupPath {
    blocks: usize,
    masked_last: bool,
}

/// Column segment of an output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    /// One tile at a known column; positions are narrowed statically.
    Static { ow_start: usize, ur: usize },
    /// `count` consecutive interior tiles of width `ur`.
    Loop { ur: usize, count: usize },
}

/// Split the output row into tiles.
fn column_plan(cfg: &ConvConfig) -> Vec<Segment> {
    let s = &cfg.shape;
    let (ur, ow) = (cfg.ur_w, cfg.ow);
    let n_full = ow / ur;
    let tail = ow % ur;

    let (b_first, b_end) = match cfg.bounds {
        BoundsMode::Naive => (n_full, n_full),
        BoundsMode::Narrowed => {
            // first column whose leftmost tap is inside the input
            let ow_l = s.pad_l.div_ceil(s.stride_w);
            // columns whose rightmost tap is inside the input
            let reach = (s.kw - 1) * s.dil_w;
            let ow_r = if s.iw - 1 + s.pad_l >= reach {
                ((s.iw - 1 + s.pad_l - reach) / s.stride_w + 1).min(ow)
            } else {
                0
            };
            let b_first = ow_l.div_ceil(ur);
            (b_first, (ow_r / ur).min(n_full).max(b_first))
        }
    };

    let mut plan = Vec::new();
    for b in 0..b_first.min(n_full) {
        plan.push(Segment::Static { ow_start: b * ur, ur });
    }
    if b_end > b_first {
        plan.push(Segment::Loop { ur, count: b_end - b_first });
    }
    for b in b_end.max(b_first)..n_full {
        plan.push(Segment::Static { ow_start: b * ur, ur });
    }
    if tail > 0 {
        plan.push(Segment::Static { ow_start: n_full * ur, ur: tail });
    }
    plan
}

struct ConvGen<'a> {
    cfg: &'a ConvConfig,
    regs: &'a RegisterAssignment,
    selt: usize,
    welt: usize,
    delt: usize,
    params: Gpr,
    src_ow: Gpr,
    out_off: Gpr,
    ow_count: Gpr,
    src_icb: Gpr,
    wei_icb: Gpr,
    icb_count: Gpr,
    src_kh: Gpr,
    wei_kh: Gpr,
    kh_count: Gpr,
    ih: Option<Gpr>,
    tmp: Gpr,
}

impl<'a> ConvGen<'a> {
    fn new(cfg: &'a ConvConfig, regs: &'a RegisterAssignment) -> Self {
        let s = &cfg.shape;
        ConvGen {
            cfg,
            regs,
            selt: s.src_dt.size_bytes(),
            welt: s.wei_dt.size_bytes(),
            delt: s.dst_dt.size_bytes(),
            params: regs.gpr(GRole::Params),
            src_ow: regs.gpr(GRole::SrcOw),
            out_off: regs.gpr(GRole::OutOff),
            ow_count: regs.gpr(GRole::OwCount),
            src_icb: regs.gpr(GRole::SrcIcb),
            wei_icb: regs.gpr(GRole::WeiIcb),
            icb_count: regs.gpr(GRole::IcbCount),
            src_kh: regs.gpr(GRole::SrcKh),
            wei_kh: regs.gpr(GRole::WeiKh),
            kh_count: regs.gpr(GRole::KhCount),
            ih: (cfg.bounds == BoundsMode::Naive).then(|| regs.gpr(GRole::Ih)),
            tmp: regs.gpr(GRole::Tmp),
        }
    }

    fn param(&self, offset: i32) -> MemOperand {
        MemOperand::new(self.params, offset)
    }

    fn mask_for(&self, path: GroupPath, block: usize) -> Option<VReg> {
        (path.masked_last && block + 1 == path.blocks).then(|| self.regs.vreg(VRole::Mask))
    }

    fn mac<A: SimdOps>(&self, asm: &mut A, acc: VReg, a: VReg, b: VReg) {
        match self.cfg.accum {
            AccumType::F32 => asm.vfma(acc, a, b),
            AccumType::S32 => asm.vmadd_i32(acc, a, b),
        }
    }

    /// Whether kernel column `kw` of output column `ow` reads inside the input.
    fn tap_valid(&self, ow: usize, kw: usize) -> bool {
        let s = &self.cfg.shape;
        let iw = (ow * s.stride_w + kw * s.dil_w) as isize - s.pad_l as isize;
        iw >= 0 && iw < s.iw as isize
    }

    fn emit<A: SimdOps>(&self, asm: &mut A) {
        let cfg = self.cfg;
        let full = GroupPath { blocks: cfg.nb_oc_blocking, masked_last: false };
        let last = GroupPath { blocks: cfg.last_group_blocks(), masked_last: cfg.needs_mask() };

        if cfg.n_oc_groups() == 1 {
            self.emit_path(asm, last);
        } else if last == full {
            self.emit_path(asm, full);
        } else {
            let last_label = asm.alloc_label();
            asm.gpr_load(self.tmp, self.param(offsets::CONV_LAST_OC_GROUP));
            asm.cmp_and_branch_ge(self.tmp, 1, last_label);
            self.emit_path(asm, full);
            asm.define_label(last_label);
            self.emit_path(asm, last);
        }
    }

    fn emit_path<A: SimdOps>(&self, asm: &mut A, path: GroupPath) {
        let s = &self.cfg.shape;
        if path.masked_last {
            if let TailMode::Masked { remainder } = self.cfg.oc_tail {
                asm.vmask(self.regs.vreg(VRole::Mask), remainder);
            }
        }
        asm.gpr_load(self.src_ow, self.param(offsets::CONV_SRC));
        asm.gpr_add_imm(self.src_ow, -((s.pad_l * s.ic * self.selt) as i64));
        asm.gpr_load_imm(self.out_off, 0);

        for seg in column_plan(self.cfg) {
            match seg {
                Segment::Static { ow_start, ur } => {
                    self.emit_tile(asm, path, ur, Some(ow_start));
                    self.advance_columns(asm, ur);
                }
                Segment::Loop { ur, count } => {
                    let top = asm.alloc_label();
                    asm.gpr_load_imm(self.ow_count, count as i64);
                    asm.define_label(top);
                    self.emit_tile(asm, path, ur, None);
                    self.advance_columns(asm, ur);
                    asm.dec_and_branch_nz(self.ow_count, top);
                }
            }
        }
        asm.ret();
    }

    fn advance_columns<A: SimdOps>(&self, asm: &mut A, ur: usize) {
        let s = &self.cfg.shape;
        asm.gpr_add_imm(self.src_ow, (ur * s.stride_w * s.ic * self.selt) as i64);
        asm.gpr_add_imm(self.out_off, (ur * s.oc * self.delt) as i64);
    }

    /// One register tile of `ur` output columns. `ow_start` is known for
    /// static tiles and enables per-position narrowing.
    fn emit_tile<A: SimdOps>(&self, asm: &mut A, path: GroupPath, ur: usize, ow_start: Option<usize>) {
        let cfg = self.cfg;
        let s = &cfg.shape;
        self.emit_init(asm, path, ur);

        asm.gpr_mov(self.src_icb, self.src_ow);
        asm.gpr_load(self.wei_icb, self.param(offsets::CONV_WEIGHTS));
        if cfg.is_depthwise() {
            self.emit_kh_loop(asm, path, ur, ow_start, 0);
        } else {
            let advance = |asm: &mut A| {
                asm.gpr_add_imm(self.src_icb, (cfg.ic_block * self.selt) as i64);
                asm.gpr_add_imm(self.wei_icb, (cfg.ic_block * s.oc * self.welt) as i64);
            };
            match cfg.nb_ic {
                0 => {}
                1 => {
                    self.emit_kh_loop(asm, path, ur, ow_start, cfg.ic_block);
                    if cfg.ic_tail > 0 {
                        advance(asm);
                    }
                }
                n => {
                    let top = asm.alloc_label();
                    asm.gpr_load_imm(self.icb_count, n as i64);
                    asm.define_label(top);
                    self.emit_kh_loop(asm, path, ur, ow_start, cfg.ic_block);
                    advance(asm);
                    asm.dec_and_branch_nz(self.icb_count, top);
                }
            }
            if cfg.ic_tail > 0 {
                self.emit_kh_loop(asm, path, ur, ow_start, cfg.ic_tail);
            }
        }
        self.emit_store(asm, path, ur);
    }

    fn emit_init<A: SimdOps>(&self, asm: &mut A, path: GroupPath, ur: usize) {
        let w = self.cfg.oc_block;
        let base = match self.cfg.init {
            AccInit::Zero => {
                for jj in 0..ur {
                    for ii in 0..path.blocks {
                        asm.vzero(self.regs.acc(jj, ii));
                    }
                }
                return;
            }
            AccInit::Bias => offsets::CONV_BIAS,
            AccInit::NegCompensation => offsets::CONV_COMPENSATION,
        };
        let operand = self.regs.vreg(VRole::Operand);
        asm.gpr_load(self.tmp, self.param(base));
        for ii in 0..path.blocks {
            let mem = MemOperand::new(self.tmp, off(ii * w * 4));
            let mask = self.mask_for(path, ii);
            if self.cfg.init == AccInit::Bias {
                asm.vload(operand, mem, DataType::F32, mask);
                for jj in 0..ur {
                    asm.vmov(self.regs.acc(jj, ii), operand);
                }
            } else {
                asm.vload(operand, mem, DataType::S32, mask);
                for jj in 0..ur {
                    let acc = self.regs.acc(jj, ii);
                    asm.vzero(acc);
                    asm.vsub_i32(acc, acc, operand);
                }
            }
        }
    }

    /// Runtime loop over the call's kernel rows. `ic_count == 0` selects the
    /// depthwise body.
    fn emit_kh_loop<A: SimdOps>(
        &self,
        asm: &mut A,
        path: GroupPath,
        ur: usize,
        ow_start: Option<usize>,
        ic_count: usize,
    ) {
        let s = &self.cfg.shape;
        let wei_row = if self.cfg.is_depthwise() { s.kw * s.oc } else { s.kw * s.ic * s.oc };

        let done = asm.alloc_label();
        let top = asm.alloc_label();
        asm.gpr_mov(self.src_kh, self.src_icb);
        asm.gpr_mov(self.wei_kh, self.wei_icb);
        asm.gpr_load(self.kh_count, self.param(offsets::CONV_KH_PADDING));
        asm.cmp_and_branch_lt(self.kh_count, 1, done);
        if let Some(ih) = self.ih {
            asm.gpr_load(ih, self.param(offsets::CONV_IH_START));
        }
        asm.define_label(top);
        let row_skip = self.ih.map(|ih| {
            let skip = asm.alloc_label();
            asm.cmp_and_branch_lt(ih, 0, skip);
            asm.cmp_and_branch_ge(ih, s.ih as i64, skip);
            skip
        });
        if ic_count == 0 {
            self.emit_depthwise_row(asm, path, ur, ow_start);
        } else {
            self.emit_row(asm, path, ur, ow_start, ic_count);
        }
        if let Some(skip) = row_skip {
            asm.define_label(skip);
        }
        asm.gpr_add_imm(self.src_kh, (s.dil_h * s.iw * s.ic * self.selt) as i64);
        asm.gpr_add_imm(self.wei_kh, (wei_row * self.welt) as i64);
        if let Some(ih) = self.ih {
            asm.gpr_add_imm(ih, s.dil_h as i64);
        }
        asm.dec_and_branch_nz(self.kh_count, top);
        asm.define_label(done);
    }

    /// Tile positions whose tap `kw` is inside the input.
    fn positions(&self, ur: usize, ow_start: Option<usize>, kw: usize) -> Vec<usize> {
        match ow_start {
            Some(ow) => (0..ur).filter(|&jj| self.tap_valid(ow + jj, kw)).collect(),
            None => (0..ur).collect(),
        }
    }

    /// Dense kernel row: kw × ic unrolled; weights loaded once per (kw, ic),
    /// one broadcast input element per position.
    fn emit_row<A: SimdOps>(&self, asm: &mut A, path: GroupPath, ur: usize, ow_start: Option<usize>, ic_count: usize) {
        let s = &self.cfg.shape;
        let w = self.cfg.oc_block;
        let input = self.regs.vreg(VRole::Input);
        for kw in 0..s.kw {
            let positions = self.positions(ur, ow_start, kw);
            if positions.is_empty() {
                continue;
            }
            for ic in 0..ic_count {
                for ii in 0..path.blocks {
                    let o = ((kw * s.ic + ic) * s.oc + ii * w) * self.welt;
                    asm.vload(self.regs.weight(ii), MemOperand::new(self.wei_kh, off(o)), s.wei_dt, self.mask_for(path, ii));
                }
                for &jj in &positions {
                    let o = ((jj * s.stride_w + kw * s.dil_w) * s.ic + ic) * self.selt;
                    asm.vbroadcast(input, MemOperand::new(self.src_kh, off(o)), s.src_dt);
                    for ii in 0..path.blocks {
                        self.mac(asm, self.regs.acc(jj, ii), input, self.regs.weight(ii));
                    }
                }
            }
        }
    }

    /// Depthwise kernel row: channel vectors of input against channel vectors
    /// of weights.
    fn emit_depthwise_row<A: SimdOps>(&self, asm: &mut A, path: GroupPath, ur: usize, ow_start: Option<usize>) {
        let s = &self.cfg.shape;
        let w = self.cfg.oc_block;
        let input = self.regs.vreg(VRole::Input);
        for kw in 0..s.kw {
            let positions = self.positions(ur, ow_start, kw);
            if positions.is_empty() {
                continue;
            }
            for ii in 0..path.blocks {
                let o = (kw * s.oc + ii * w) * self.welt;
                asm.vload(self.regs.weight(ii), MemOperand::new(self.wei_kh, off(o)), s.wei_dt, self.mask_for(path, ii));
            }
            for &jj in &positions {
                for ii in 0..path.blocks {
                    let o = ((jj * s.stride_w + kw * s.dil_w) * s.ic + ii * w) * self.selt;
                    asm.vload(input, MemOperand::new(self.src_kh, off(o)), s.src_dt, self.mask_for(path, ii));
                    self.mac(asm, self.regs.acc(jj, ii), input, self.regs.weight(ii));
                }
            }
        }
    }

    fn emit_store<A: SimdOps>(&self, asm: &mut A, path: GroupPath, ur: usize) {
        let cfg = self.cfg;
        let s = &cfg.shape;
        let w = cfg.oc_block;
        let scratch = self.regs.vreg(VRole::Scratch);
        let mut ctx = PostOpCtx::new(
            self.params,
            self.out_off,
            self.tmp,
            scratch,
            self.regs.try_vreg(VRole::Operand),
            s.dst_dt,
        );
        for jj in 0..ur {
            for ii in 0..path.blocks {
                let acc = self.regs.acc(jj, ii);
                let site = AccSite {
                    chan_off: off(ii * w * 4),
                    row_off: off((jj * s.oc + ii * w) * self.delt),
                    mask: self.mask_for(path, ii),
                };
                if let StoreConversion::ViaF32 { .. } = cfg.store {
                    asm.vcvt_i32_f32(acc, acc);
                }
                inject(asm, &cfg.store_ops, acc, site, &mut ctx);
                if let StoreConversion::ViaF32 { saturate: true } = cfg.store {
                    emit_saturate(asm, acc, scratch, s.dst_dt);
                }
                let dst = ctx.base(asm, Base::Dst);
                asm.vstore(MemOperand::new(dst, site.row_off), acc, s.dst_dt, site.mask);
            }
        }
    }
}

/// Generate the routine for `cfg` using the planned registers.
pub fn generate(cfg: &ConvConfig, regs: &RegisterAssignment) -> Routine {
    debug_assert_eq!(regs.verify(), Ok(()));
    let mut asm = Assembler::new(cfg.simd_width());
    ConvGen::new(cfg, regs).emit(&mut asm);
    let program = asm.finalize();
    let output = CodegenOutput { code: encode(&program), instructions: program.len(), scratchpad_bytes: 0 };
    trace!("generated conv routine: {} instructions, {} bytes", output.instructions, output.code.len());
    let hash = config_hash(cfg.descriptor().as_bytes(), &cfg.target);
    Routine::from_parts(output, program, cfg.simd_width(), hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::attr::ConvAttr;
    use crate::compiler::codegen::insn::Insn;
    use crate::compiler::codegen::target_desc::TargetDesc;
    use crate::compiler::config::resolve;
    use crate::compiler::planner::plan;
    use crate::compiler::shape::ConvShape;

    fn cfg_for(shape: ConvShape, attr: ConvAttr) -> ConvConfig {
        resolve(&shape, &attr, &TargetDesc::avx2()).unwrap()
    }

    #[test]
    fn test_column_plan_splits_padding() {
        // OW = 16, pad 1, 3-wide kernel: column 0 and 15 touch padding.
        let cfg = cfg_for(ConvShape::new(8, 8, (4, 16), (3, 3)).pad(1), ConvAttr::new().blocking(4, 1));
        assert_eq!(
            column_plan(&cfg),
            vec![
                Segment::Static { ow_start: 0, ur: 4 },
                Segment::Loop { ur: 4, count: 2 },
                Segment::Static { ow_start: 12, ur: 4 },
            ]
        );
    }

    #[test]
    fn test_column_plan_with_tail() {
        let cfg = cfg_for(ConvShape::new(8, 8, (4, 11), (3, 3)), ConvAttr::new().blocking(3, 1));
        // OW = 9, no padding: every full tile is interior.
        assert_eq!(column_plan(&cfg), vec![Segment::Loop { ur: 3, count: 3 }]);

        let cfg = cfg_for(ConvShape::new(8, 8, (4, 12), (3, 3)), ConvAttr::new().blocking(4, 1));
        // OW = 10: two interior tiles and a 2-wide tail.
        assert_eq!(
            column_plan(&cfg),
            vec![Segment::Loop { ur: 4, count: 2 }, Segment::Static { ow_start: 8, ur: 2 }]
        );
    }

    #[test]
    fn test_naive_plan_is_all_static() {
        let attr = ConvAttr::new().blocking(4, 1).bounds(BoundsMode::Naive);
        let cfg = cfg_for(ConvShape::new(8, 8, (4, 16), (3, 3)).pad(1), attr);
        let plan = column_plan(&cfg);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|s| matches!(s, Segment::Static { .. })));
    }

    #[test]
    fn test_padding_wider_than_row() {
        // Every column sees padding on one side: no interior loop.
        let cfg = cfg_for(ConvShape::new(8, 8, (3, 2), (3, 3)).pad(1), ConvAttr::new().blocking(1, 1));
        assert!(column_plan(&cfg).iter().all(|s| matches!(s, Segment::Static { .. })));
    }

    #[test]
    fn test_last_group_branch_only_when_paths_differ() {
        let attr = ConvAttr::new().blocking(2, 1);
        let even = cfg_for(ConvShape::new(8, 16, (3, 4), (1, 1)), attr.clone());
        let r = generate(&even, &plan(&even).unwrap());
        assert!(!r.program().iter().any(|i| matches!(i, Insn::VMask { .. })));
        assert_eq!(r.program().iter().filter(|i| **i == Insn::Ret).count(), 1);

        let tail = cfg_for(ConvShape::new(8, 19, (3, 4), (1, 1)), attr);
        let r = generate(&tail, &plan(&tail).unwrap());
        assert_eq!(r.program().iter().filter(|i| matches!(i, Insn::VMask { lanes: 3, .. })).count(), 1);
        assert_eq!(r.program().iter().filter(|i| **i == Insn::Ret).count(), 2);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let cfg = cfg_for(ConvShape::new(19, 19, (5, 8), (3, 3)).pad(1), ConvAttr::new());
        let regs = plan(&cfg).unwrap();
        let a = generate(&cfg, &regs);
        let b = generate(&cfg, &regs);
        assert_eq!(a.code(), b.code());
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_decode_of_generated_code_is_identity() {
        let cfg = cfg_for(ConvShape::new(19, 19, (5, 8), (3, 3)).pad(1), ConvAttr::new());
        let r = generate(&cfg, &plan(&cfg).unwrap());
        let decoded = Routine::from_code(r.code(), r.simd_width(), 0, r.config_hash()).unwrap();
        assert_eq!(decoded.program(), r.program());
    }

    #[test]
    fn test_naive_mode_checks_rows_at_runtime() {
        let attr = ConvAttr::new().bounds(BoundsMode::Naive);
        let cfg = cfg_for(ConvShape::new(8, 8, (4, 4), (3, 3)).pad(1), attr);
        let r = generate(&cfg, &plan(&cfg).unwrap());
        let ih_checks = r
            .program()
            .iter()
            .filter(|i| matches!(i, Insn::CmpJge { imm: 4, .. }))
            .count();
        assert!(ih_checks > 0);
    }
}
