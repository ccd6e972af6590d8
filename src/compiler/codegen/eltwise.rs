//! Elementwise kernel generator (PReLU and activations).
//!
//! Flat modes: unrolled loop over `unroll` vectors, single-vector loop, then
//! a masked tail vector when the resolved tail is non-zero. `PerChannel`
//! walks rows; each row is statically unrolled over its channel blocks.

use log::trace;

use super::assembler::Assembler;
use super::insn::encode;
use super::postops::{emit_activation, emit_saturate};
use super::simd_ops::{Gpr, MemOperand, SimdOps};
use super::CodegenOutput;
use crate::compiler::call_params::offsets;
use crate::compiler::eltwise::{EltwiseAlg, EltwiseConfig, PreluMode};
use crate::compiler::executable::{config_hash, Routine};
use crate::compiler::planner::{GRole, RegisterAssignment, VRole};
use crate::types::DataType;

struct EltwiseGen<'a> {
    cfg: &'a EltwiseConfig,
    regs: &'a RegisterAssignment,
    selt: usize,
    delt: usize,
}

impl<'a> EltwiseGen<'a> {
    fn src(&self) -> Gpr {
        self.regs.gpr(GRole::Src)
    }

    /// Process vectors `(slot, element offset, masked)` stage by stage.
    fn emit_vectors<A: SimdOps>(&self, asm: &mut A, items: &[(usize, usize, bool)]) {
        let d = &self.cfg.desc;
        let mask = self.regs.try_vreg(VRole::Mask);
        let scratch = self.regs.vreg(VRole::Scratch);
        let (src, dst, wei) = (self.src(), self.regs.gpr(GRole::Dst), self.regs.gpr(GRole::Wei));
        let lane_mask = |masked: bool| if masked { mask } else { None };

        for &(u, e, masked) in items {
            let x = self.regs.acc(u, 0);
            asm.vload(x, MemOperand::new(src, (e * self.selt) as i32), d.src_dt, lane_mask(masked));
            if d.src_dt.is_integer() {
                asm.vcvt_i32_f32(x, x);
            }
        }
        for &(u, e, masked) in items {
            let (x, t) = (self.regs.acc(u, 0), self.regs.weight(u));
            match d.alg {
                EltwiseAlg::Prelu(mode) => {
                    let slope = match mode {
                        PreluMode::PerTensor => self.regs.vreg(VRole::Operand),
                        PreluMode::PerChannel | PreluMode::Full => {
                            asm.vload(t, MemOperand::new(wei, (e * 4) as i32), DataType::F32, lane_mask(masked));
                            t
                        }
                    };
                    asm.vmul(t, x, slope);
                    asm.vselect_pos(x, x, x, t);
                }
                EltwiseAlg::Activation(act) => emit_activation(asm, act, x, scratch, Some(t)),
            }
            emit_saturate(asm, x, scratch, d.dst_dt);
        }
        for &(u, e, masked) in items {
            let x = self.regs.acc(u, 0);
            asm.vstore(MemOperand::new(dst, (e * self.delt) as i32), x, d.dst_dt, lane_mask(masked));
        }
    }

    fn advance<A: SimdOps>(&self, asm: &mut A, elems: usize) {
        asm.gpr_add_imm(self.src(), (elems * self.selt) as i64);
        asm.gpr_add_imm(self.regs.gpr(GRole::Dst), (elems * self.delt) as i64);
        if matches!(self.cfg.desc.alg, EltwiseAlg::Prelu(PreluMode::Full)) {
            asm.gpr_add_imm(self.regs.gpr(GRole::Wei), (elems * 4) as i64);
        }
    }

    /// Counted loop over runtime `work` in steps of `unroll` vectors.
    fn emit_flat_loop<A: SimdOps>(&self, asm: &mut A, unroll: usize) {
        let w = self.cfg.simd_width();
        let work = self.regs.gpr(GRole::Work);
        let step = unroll * w;
        let (top, end) = (asm.alloc_label(), asm.alloc_label());
        asm.define_label(top);
        asm.cmp_and_branch_lt(work, step as i64, end);
        let items: Vec<_> = (0..unroll).map(|u| (u, u * w, false)).collect();
        self.emit_vectors(asm, &items);
        self.advance(asm, step);
        asm.gpr_add_imm(work, -(step as i64));
        asm.jump(top);
        asm.define_label(end);
    }

    fn emit_flat<A: SimdOps>(&self, asm: &mut A) {
        if self.cfg.unroll > 1 {
            self.emit_flat_loop(asm, self.cfg.unroll);
        }
        self.emit_flat_loop(asm, 1);
        if self.cfg.tail > 0 {
            let done = asm.alloc_label();
            asm.cmp_and_branch_lt(self.regs.gpr(GRole::Work), 1, done);
            self.emit_vectors(asm, &[(0, 0, true)]);
            asm.define_label(done);
        }
    }

    fn emit_rows<A: SimdOps>(&self, asm: &mut A) {
        let w = self.cfg.simd_width();
        let channels = self.cfg.desc.channels;
        let work = self.regs.gpr(GRole::Work);
        let blocks: Vec<(usize, bool)> = (0..channels / w)
            .map(|b| (b * w, false))
            .chain((self.cfg.tail > 0).then_some(((channels / w) * w, true)))
            .collect();

        let (top, done) = (asm.alloc_label(), asm.alloc_label());
        asm.cmp_and_branch_lt(work, 1, done);
        asm.define_label(top);
        for chunk in blocks.chunks(self.cfg.unroll) {
            let items: Vec<_> = chunk.iter().enumerate().map(|(u, &(e, masked))| (u, e, masked)).collect();
            self.emit_vectors(asm, &items);
        }
        self.advance(asm, channels);
        asm.dec_and_branch_nz(work, top);
        asm.define_label(done);
    }

    fn emit<A: SimdOps>(&self, asm: &mut A) {
        let params = self.regs.gpr(GRole::Params);
        let wei = self.regs.gpr(GRole::Wei);
        asm.gpr_load(self.src(), MemOperand::new(params, offsets::ELT_SRC));
        asm.gpr_load(self.regs.gpr(GRole::Dst), MemOperand::new(params, offsets::ELT_DST));
        asm.gpr_load(wei, MemOperand::new(params, offsets::ELT_WEIGHTS));
        asm.gpr_load(self.regs.gpr(GRole::Work), MemOperand::new(params, offsets::ELT_WORK));
        if let EltwiseAlg::Prelu(PreluMode::PerTensor) = self.cfg.desc.alg {
            asm.vbroadcast(self.regs.vreg(VRole::Operand), MemOperand::new(wei, 0), DataType::F32);
        }
        if self.cfg.tail > 0 {
            asm.vmask(self.regs.vreg(VRole::Mask), self.cfg.tail);
        }
        if self.cfg.desc.is_per_channel() {
            self.emit_rows(asm);
        } else {
            self.emit_flat(asm);
        }
        asm.ret();
    }
}

/// Generate the routine for an elementwise configuration.
pub fn generate_eltwise(cfg: &EltwiseConfig, regs: &RegisterAssignment) -> Routine {
    debug_assert_eq!(regs.verify(), Ok(()));
    let g = EltwiseGen {
        cfg,
        regs,
        selt: cfg.desc.src_dt.size_bytes(),
        delt: cfg.desc.dst_dt.size_bytes(),
    };
    let mut asm = Assembler::new(cfg.simd_width());
    g.emit(&mut asm);
    let program = asm.finalize();
    let output = CodegenOutput { code: encode(&program), instructions: program.len(), scratchpad_bytes: 0 };
    trace!("generated eltwise routine: {} instructions, {} bytes", output.instructions, output.code.len());
    let hash = config_hash(cfg.descriptor().as_bytes(), &cfg.target);
    Routine::from_parts(output, program, cfg.simd_width(), hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::attr::Activation;
    use crate::compiler::call_params::{EltwiseBuffers, EltwiseCallParams};
    use crate::compiler::codegen::target_desc::TargetDesc;
    use crate::compiler::eltwise::{resolve_eltwise, EltwiseDesc};
    use crate::compiler::planner::plan_eltwise;

    fn build(desc: EltwiseDesc, target: TargetDesc) -> (EltwiseConfig, Routine) {
        let cfg = resolve_eltwise(&desc, &target).unwrap();
        let regs = plan_eltwise(&cfg).unwrap();
        let r = generate_eltwise(&cfg, &regs);
        (cfg, r)
    }

    fn run(cfg: &EltwiseConfig, r: &Routine, src: &[f32], wei: &[f32], dst: &mut [f32]) {
        let bufs = EltwiseBuffers {
            src: src.as_ptr() as *const u8,
            weights: wei.as_ptr() as *const u8,
            dst: dst.as_mut_ptr() as *mut u8,
        };
        let p: EltwiseCallParams = cfg.call_params(&bufs, 0..cfg.work_amount());
        unsafe { r.invoke(&p as *const EltwiseCallParams as *const u8) };
    }

    #[test]
    fn test_prelu_per_tensor_with_tail() {
        let (cfg, r) = build(EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::PerTensor), 1, 37), TargetDesc::avx2());
        let src: Vec<f32> = (0..37).map(|i| i as f32 - 18.0).collect();
        let mut dst = vec![f32::NAN; 38];
        run(&cfg, &r, &src, &[0.25], &mut dst);
        for i in 0..37 {
            let x = src[i];
            assert_eq!(dst[i], if x > 0.0 { x } else { x * 0.25 }, "i={i}");
        }
        assert!(dst[37].is_nan(), "guard element overwritten");
    }

    #[test]
    fn test_prelu_per_channel_rows() {
        let (cfg, r) = build(EltwiseDesc::new(EltwiseAlg::Prelu(PreluMode::PerChannel), 3, 6), TargetDesc::sse41());
        let src = vec![-1.0f32; 18];
        let wei: Vec<f32> = (0..6).map(|c| c as f32).collect();
        let mut dst = vec![0.0f32; 18];
        run(&cfg, &r, &src, &wei, &mut dst);
        for row in 0..3 {
            for c in 0..6 {
                assert_eq!(dst[row * 6 + c], -(c as f32));
            }
        }
    }

    #[test]
    fn test_activation_unrolled_loop_used() {
        let act = Activation::Clip { lo: 0.0, hi: 6.0 };
        let (cfg, r) = build(EltwiseDesc::new(EltwiseAlg::Activation(act), 4, 16), TargetDesc::avx2());
        assert_eq!(cfg.unroll, 4);
        let src: Vec<f32> = (0..64).map(|i| (i as f32) * 0.25 - 4.0).collect();
        let mut dst = vec![0.0f32; 64];
        run(&cfg, &r, &src, &[], &mut dst);
        for i in 0..64 {
            assert_eq!(dst[i], act.apply(src[i]));
        }
    }
}
