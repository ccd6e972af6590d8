//! Assembler — the `SimdOps` backend that records virtual-ISA instructions.
//!
//! Branches are emitted against labels and patched to relative offsets in
//! `finish()`. The result is a position-independent byte sequence that
//! `Routine::from_code` decodes for execution.

use super::insn::{encode, Insn};
use super::simd_ops::{Gpr, Label, MemOperand, SimdOps, VReg};
use super::CodegenOutput;
use crate::types::DataType;

/// Records emitted instructions and resolves labels.
pub struct Assembler {
    insns: Vec<Insn>,
    /// Label id → instruction index it is bound to.
    labels: Vec<Option<usize>>,
    /// (instruction index, label) pairs whose `rel` still needs patching.
    fixups: Vec<(usize, Label)>,
    simd_width: usize,
}

impl Assembler {
    pub fn new(simd_width: usize) -> Self {
        Assembler {
            insns: Vec::with_capacity(256),
            labels: Vec::new(),
            fixups: Vec::new(),
            simd_width,
        }
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    #[inline]
    fn push(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    fn push_branch(&mut self, insn: Insn, label: Label) {
        self.fixups.push((self.insns.len(), label));
        self.insns.push(insn);
    }

    /// Resolve labels and return the finished program.
    ///
    /// # Panics
    /// Panics if a branch targets a label that was never defined; that is a
    /// generator bug, not a user-facing condition.
    pub fn finalize(mut self) -> Vec<Insn> {
        for &(at, label) in &self.fixups {
            let target = self.labels[label.0 as usize];
            assert!(target.is_some(), "branch at {at} targets unbound label {}", label.0);
            let target = target.unwrap_or_default();
            let rel = i32::try_from(target as i64 - at as i64)
                .unwrap_or_else(|_| panic!("branch at {at} out of encodable range"));
            match &mut self.insns[at] {
                Insn::Jmp { rel: r }
                | Insn::DecJnz { rel: r, .. }
                | Insn::CmpJlt { rel: r, .. }
                | Insn::CmpJge { rel: r, .. } => *r = rel,
                other => unreachable!("fixup recorded for non-branch {other:?}"),
            }
        }
        self.insns
    }

    /// Resolve labels and encode.
    pub fn finish(self, scratchpad_bytes: usize) -> CodegenOutput {
        let program = self.finalize();
        CodegenOutput {
            code: encode(&program),
            instructions: program.len(),
            scratchpad_bytes,
        }
    }
}

impl SimdOps for Assembler {
    fn vzero(&mut self, dst: VReg) {
        self.push(Insn::VZero { dst });
    }

    fn vmov(&mut self, dst: VReg, src: VReg) {
        if dst != src {
            self.push(Insn::VMov { dst, src });
        }
    }

    fn vbroadcast_const(&mut self, dst: VReg, val: f32) {
        self.push(Insn::VConst { dst, bits: val.to_bits() });
    }

    fn vload(&mut self, dst: VReg, mem: MemOperand, dt: DataType, mask: Option<VReg>) {
        self.push(Insn::VLoad { dst, mem, dt, mask });
    }

    fn vbroadcast(&mut self, dst: VReg, mem: MemOperand, dt: DataType) {
        self.push(Insn::VBroadcast { dst, mem, dt });
    }

    fn vstore(&mut self, mem: MemOperand, src: VReg, dt: DataType, mask: Option<VReg>) {
        self.push(Insn::VStore { src, mem, dt, mask });
    }

    fn vmask(&mut self, dst: VReg, lanes: usize) {
        assert!(
            lanes > 0 && lanes <= self.simd_width,
            "mask of {lanes} lanes on a {}-lane target",
            self.simd_width
        );
        self.push(Insn::VMask { dst, lanes: lanes as u8 });
    }

    fn vfma(&mut self, acc: VReg, a: VReg, b: VReg) {
        self.push(Insn::VFma { acc, a, b });
    }

    fn vmadd_i32(&mut self, acc: VReg, a: VReg, b: VReg) {
        self.push(Insn::VMaddI32 { acc, a, b });
    }

    fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VSubI32 { dst, a, b });
    }

    fn vadd(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VAdd { dst, a, b });
    }

    fn vsub(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VSub { dst, a, b });
    }

    fn vmul(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VMul { dst, a, b });
    }

    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VMax { dst, a, b });
    }

    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg) {
        self.push(Insn::VMin { dst, a, b });
    }

    fn vselect_pos(&mut self, dst: VReg, cond: VReg, a: VReg, b: VReg) {
        self.push(Insn::VSelectPos { dst, cond, a, b });
    }

    fn vcvt_i32_f32(&mut self, dst: VReg, src: VReg) {
        self.push(Insn::VCvtI32F32 { dst, src });
    }

    fn vcvt_f32_i32(&mut self, dst: VReg, src: VReg) {
        self.push(Insn::VCvtF32I32 { dst, src });
    }

    fn alloc_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    fn define_label(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label {} defined twice", label.0);
        *slot = Some(self.insns.len());
    }

    fn jump(&mut self, label: Label) {
        self.push_branch(Insn::Jmp { rel: 0 }, label);
    }

    fn dec_and_branch_nz(&mut self, counter: Gpr, label: Label) {
        self.push_branch(Insn::DecJnz { reg: counter, rel: 0 }, label);
    }

    fn cmp_and_branch_lt(&mut self, reg: Gpr, imm: i64, label: Label) {
        self.push_branch(Insn::CmpJlt { reg, imm, rel: 0 }, label);
    }

    fn cmp_and_branch_ge(&mut self, reg: Gpr, imm: i64, label: Label) {
        self.push_branch(Insn::CmpJge { reg, imm, rel: 0 }, label);
    }

    fn gpr_load(&mut self, dst: Gpr, mem: MemOperand) {
        self.push(Insn::GLoad { dst, mem });
    }

    fn gpr_load_imm(&mut self, dst: Gpr, imm: i64) {
        self.push(Insn::GMovImm { dst, imm });
    }

    fn gpr_add_imm(&mut self, dst: Gpr, imm: i64) {
        if imm != 0 {
            self.push(Insn::GAddImm { dst, imm });
        }
    }

    fn gpr_add(&mut self, dst: Gpr, src: Gpr) {
        self.push(Insn::GAdd { dst, src });
    }

    fn gpr_mov(&mut self, dst: Gpr, src: Gpr) {
        if dst != src {
            self.push(Insn::GMov { dst, src });
        }
    }

    fn ret(&mut self) {
        self.push(Insn::Ret);
    }
}
