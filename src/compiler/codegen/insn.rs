//! Instruction set of the virtual vector machine and its byte encoding.
//!
//! Every instruction is one opcode byte followed by fixed-width little-endian
//! operands. Branch targets are stored relative to the branch instruction, so
//! an encoded routine is position independent.

use super::simd_ops::{Gpr, MemOperand, VReg};
use super::target_desc::{MAX_GPRS, MAX_LANES, MAX_VREGS};
use crate::types::{DataType, KernelError};

/// Sentinel register index meaning "no mask".
const NO_MASK: u8 = 0xFF;

/// One decoded instruction.
///
/// Branch `rel` fields are instruction-index deltas relative to the branch
/// itself (`target = pc + rel`). f32 constants are stored as raw bits so the
/// program is `Eq + Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Insn {
    Ret,
    Jmp { rel: i32 },
    DecJnz { reg: Gpr, rel: i32 },
    CmpJlt { reg: Gpr, imm: i64, rel: i32 },
    CmpJge { reg: Gpr, imm: i64, rel: i32 },
    GLoad { dst: Gpr, mem: MemOperand },
    GMovImm { dst: Gpr, imm: i64 },
    GMov { dst: Gpr, src: Gpr },
    GAddImm { dst: Gpr, imm: i64 },
    GAdd { dst: Gpr, src: Gpr },
    VZero { dst: VReg },
    VMov { dst: VReg, src: VReg },
    VConst { dst: VReg, bits: u32 },
    VLoad { dst: VReg, mem: MemOperand, dt: DataType, mask: Option<VReg> },
    VBroadcast { dst: VReg, mem: MemOperand, dt: DataType },
    VStore { src: VReg, mem: MemOperand, dt: DataType, mask: Option<VReg> },
    VMask { dst: VReg, lanes: u8 },
    VFma { acc: VReg, a: VReg, b: VReg },
    VMaddI32 { acc: VReg, a: VReg, b: VReg },
    VSubI32 { dst: VReg, a: VReg, b: VReg },
    VAdd { dst: VReg, a: VReg, b: VReg },
    VSub { dst: VReg, a: VReg, b: VReg },
    VMul { dst: VReg, a: VReg, b: VReg },
    VMax { dst: VReg, a: VReg, b: VReg },
    VMin { dst: VReg, a: VReg, b: VReg },
    VSelectPos { dst: VReg, cond: VReg, a: VReg, b: VReg },
    VCvtI32F32 { dst: VReg, src: VReg },
    VCvtF32I32 { dst: VReg, src: VReg },
}

mod op {
    pub const RET: u8 = 0x00;
    pub const JMP: u8 = 0x01;
    pub const DEC_JNZ: u8 = 0x02;
    pub const CMP_JLT: u8 = 0x03;
    pub const CMP_JGE: u8 = 0x04;
    pub const GLOAD: u8 = 0x10;
    pub const GMOV_IMM: u8 = 0x11;
    pub const GMOV: u8 = 0x12;
    pub const GADD_IMM: u8 = 0x13;
    pub const GADD: u8 = 0x14;
    pub const VZERO: u8 = 0x20;
    pub const VMOV: u8 = 0x21;
    pub const VCONST: u8 = 0x22;
    pub const VLOAD: u8 = 0x23;
    pub const VBROADCAST: u8 = 0x24;
    pub const VSTORE: u8 = 0x25;
    pub const VMASK: u8 = 0x26;
    pub const VFMA: u8 = 0x30;
    pub const VMADD_I32: u8 = 0x31;
    pub const VSUB_I32: u8 = 0x32;
    pub const VADD: u8 = 0x33;
    pub const VSUB: u8 = 0x34;
    pub const VMUL: u8 = 0x35;
    pub const VMAX: u8 = 0x36;
    pub const VMIN: u8 = 0x37;
    pub const VSELECT_POS: u8 = 0x38;
    pub const VCVT_I32_F32: u8 = 0x39;
    pub const VCVT_F32_I32: u8 = 0x3A;
}

// ── Encoding ────────────────────────────────────────────────────────────────

fn put_mem(out: &mut Vec<u8>, mem: MemOperand) {
    out.push(mem.base.0);
    out.extend_from_slice(&mem.offset.to_le_bytes());
}

fn put_mask(out: &mut Vec<u8>, mask: Option<VReg>) {
    out.push(mask.map_or(NO_MASK, |m| m.0));
}

impl Insn {
    /// Append the encoding of this instruction to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            Insn::Ret => out.push(op::RET),
            Insn::Jmp { rel } => {
                out.push(op::JMP);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Insn::DecJnz { reg, rel } => {
                out.extend_from_slice(&[op::DEC_JNZ, reg.0]);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Insn::CmpJlt { reg, imm, rel } | Insn::CmpJge { reg, imm, rel } => {
                let code = if matches!(self, Insn::CmpJlt { .. }) { op::CMP_JLT } else { op::CMP_JGE };
                out.extend_from_slice(&[code, reg.0]);
                out.extend_from_slice(&imm.to_le_bytes());
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Insn::GLoad { dst, mem } => {
                out.extend_from_slice(&[op::GLOAD, dst.0]);
                put_mem(out, mem);
            }
            Insn::GMovImm { dst, imm } => {
                out.extend_from_slice(&[op::GMOV_IMM, dst.0]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::GMov { dst, src } => out.extend_from_slice(&[op::GMOV, dst.0, src.0]),
            Insn::GAddImm { dst, imm } => {
                out.extend_from_slice(&[op::GADD_IMM, dst.0]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::GAdd { dst, src } => out.extend_from_slice(&[op::GADD, dst.0, src.0]),
            Insn::VZero { dst } => out.extend_from_slice(&[op::VZERO, dst.0]),
            Insn::VMov { dst, src } => out.extend_from_slice(&[op::VMOV, dst.0, src.0]),
            Insn::VConst { dst, bits } => {
                out.extend_from_slice(&[op::VCONST, dst.0]);
                out.extend_from_slice(&bits.to_le_bytes());
            }
            Insn::VLoad { dst, mem, dt, mask } => {
                out.extend_from_slice(&[op::VLOAD, dst.0, dt.tag()]);
                put_mask(out, mask);
                put_mem(out, mem);
            }
            Insn::VBroadcast { dst, mem, dt } => {
                out.extend_from_slice(&[op::VBROADCAST, dst.0, dt.tag()]);
                put_mem(out, mem);
            }
            Insn::VStore { src, mem, dt, mask } => {
                out.extend_from_slice(&[op::VSTORE, src.0, dt.tag()]);
                put_mask(out, mask);
                put_mem(out, mem);
            }
            Insn::VMask { dst, lanes } => out.extend_from_slice(&[op::VMASK, dst.0, lanes]),
            Insn::VFma { acc, a, b } => out.extend_from_slice(&[op::VFMA, acc.0, a.0, b.0]),
            Insn::VMaddI32 { acc, a, b } => {
                out.extend_from_slice(&[op::VMADD_I32, acc.0, a.0, b.0])
            }
            Insn::VSubI32 { dst, a, b } => out.extend_from_slice(&[op::VSUB_I32, dst.0, a.0, b.0]),
            Insn::VAdd { dst, a, b } => out.extend_from_slice(&[op::VADD, dst.0, a.0, b.0]),
            Insn::VSub { dst, a, b } => out.extend_from_slice(&[op::VSUB, dst.0, a.0, b.0]),
            Insn::VMul { dst, a, b } => out.extend_from_slice(&[op::VMUL, dst.0, a.0, b.0]),
            Insn::VMax { dst, a, b } => out.extend_from_slice(&[op::VMAX, dst.0, a.0, b.0]),
            Insn::VMin { dst, a, b } => out.extend_from_slice(&[op::VMIN, dst.0, a.0, b.0]),
            Insn::VSelectPos { dst, cond, a, b } => {
                out.extend_from_slice(&[op::VSELECT_POS, dst.0, cond.0, a.0, b.0])
            }
            Insn::VCvtI32F32 { dst, src } => {
                out.extend_from_slice(&[op::VCVT_I32_F32, dst.0, src.0])
            }
            Insn::VCvtF32I32 { dst, src } => {
                out.extend_from_slice(&[op::VCVT_F32_I32, dst.0, src.0])
            }
        }
    }
}

/// Encode a program into its byte representation.
pub fn encode(program: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(program.len() * 8);
    for insn in program {
        insn.encode_into(&mut out);
    }
    out
}

// ── Decoding ────────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> Reader<'a> {
    fn err(&self, reason: impl Into<String>) -> KernelError {
        KernelError::Decode { offset: self.start, reason: reason.into() }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], KernelError> {
        let end = self.pos + N;
        let bytes = self.bytes;
        let slice = bytes
            .get(self.pos..end)
            .ok_or_else(|| self.err("truncated instruction"))?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, KernelError> {
        Ok(self.take::<1>()?[0])
    }

    fn i32(&mut self) -> Result<i32, KernelError> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }

    fn u32(&mut self) -> Result<u32, KernelError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    fn i64(&mut self) -> Result<i64, KernelError> {
        Ok(i64::from_le_bytes(self.take::<8>()?))
    }

    fn gpr(&mut self) -> Result<Gpr, KernelError> {
        match self.u8()? {
            g if (g as usize) < MAX_GPRS => Ok(Gpr(g)),
            g => Err(self.err(format!("general register g{g} outside a {MAX_GPRS}-register file"))),
        }
    }

    fn vreg(&mut self) -> Result<VReg, KernelError> {
        match self.u8()? {
            v if (v as usize) < MAX_VREGS => Ok(VReg(v)),
            v => Err(self.err(format!("vector register v{v} outside a {MAX_VREGS}-register file"))),
        }
    }

    fn dt(&mut self) -> Result<DataType, KernelError> {
        let tag = self.u8()?;
        DataType::from_tag(tag).ok_or_else(|| self.err(format!("unknown data type tag {tag}")))
    }

    fn mask(&mut self) -> Result<Option<VReg>, KernelError> {
        if self.bytes.get(self.pos) == Some(&NO_MASK) {
            self.pos += 1;
            return Ok(None);
        }
        self.vreg().map(Some)
    }

    fn mem(&mut self) -> Result<MemOperand, KernelError> {
        let base = self.gpr()?;
        let offset = self.i32()?;
        Ok(MemOperand { base, offset })
    }

    fn three(&mut self) -> Result<(VReg, VReg, VReg), KernelError> {
        Ok((self.vreg()?, self.vreg()?, self.vreg()?))
    }
}

/// Decode an encoded program.
///
/// Register indices are checked against the executor's register files.
pub fn decode(bytes: &[u8]) -> Result<Vec<Insn>, KernelError> {
    decode_with_offsets(bytes).map(|(program, _)| program)
}

/// Decode a program and check it for a `width`-lane machine: masks no wider
/// than a vector and every branch target inside the program.
pub fn decode_for_width(bytes: &[u8], width: usize) -> Result<Vec<Insn>, KernelError> {
    let (program, offsets) = decode_with_offsets(bytes)?;
    let width = width.min(MAX_LANES);
    for (pc, insn) in program.iter().enumerate() {
        let reason = match *insn {
            Insn::VMask { lanes, .. } if lanes as usize > width => {
                format!("mask of {lanes} lanes on a {width}-lane vector")
            }
            Insn::Jmp { rel }
            | Insn::DecJnz { rel, .. }
            | Insn::CmpJlt { rel, .. }
            | Insn::CmpJge { rel, .. } => match usize::try_from(pc as i64 + rel as i64) {
                Ok(target) if target < program.len() => continue,
                _ => format!("branch at instruction {pc} leaves the program (rel {rel})"),
            },
            _ => continue,
        };
        return Err(KernelError::Decode { offset: offsets[pc], reason });
    }
    Ok(program)
}

/// Decode, also returning the byte offset of each instruction.
fn decode_with_offsets(bytes: &[u8]) -> Result<(Vec<Insn>, Vec<usize>), KernelError> {
    let mut r = Reader { bytes, pos: 0, start: 0 };
    let mut program = Vec::new();
    let mut offsets = Vec::new();
    while r.pos < bytes.len() {
        r.start = r.pos;
        let code = r.u8()?;
        let insn = match code {
            op::RET => Insn::Ret,
            op::JMP => Insn::Jmp { rel: r.i32()? },
            op::DEC_JNZ => Insn::DecJnz { reg: r.gpr()?, rel: r.i32()? },
            op::CMP_JLT => Insn::CmpJlt { reg: r.gpr()?, imm: r.i64()?, rel: r.i32()? },
            op::CMP_JGE => Insn::CmpJge { reg: r.gpr()?, imm: r.i64()?, rel: r.i32()? },
            op::GLOAD => Insn::GLoad { dst: r.gpr()?, mem: r.mem()? },
            op::GMOV_IMM => Insn::GMovImm { dst: r.gpr()?, imm: r.i64()? },
            op::GMOV => Insn::GMov { dst: r.gpr()?, src: r.gpr()? },
            op::GADD_IMM => Insn::GAddImm { dst: r.gpr()?, imm: r.i64()? },
            op::GADD => Insn::GAdd { dst: r.gpr()?, src: r.gpr()? },
            op::VZERO => Insn::VZero { dst: r.vreg()? },
            op::VMOV => Insn::VMov { dst: r.vreg()?, src: r.vreg()? },
            op::VCONST => Insn::VConst { dst: r.vreg()?, bits: r.u32()? },
            op::VLOAD => {
                let dst = r.vreg()?;
                let dt = r.dt()?;
                let mask = r.mask()?;
                Insn::VLoad { dst, mem: r.mem()?, dt, mask }
            }
            op::VBROADCAST => {
                let dst = r.vreg()?;
                let dt = r.dt()?;
                Insn::VBroadcast { dst, mem: r.mem()?, dt }
            }
            op::VSTORE => {
                let src = r.vreg()?;
                let dt = r.dt()?;
                let mask = r.mask()?;
                Insn::VStore { src, mem: r.mem()?, dt, mask }
            }
            op::VMASK => Insn::VMask { dst: r.vreg()?, lanes: r.u8()? },
            op::VFMA => {
                let (acc, a, b) = r.three()?;
                Insn::VFma { acc, a, b }
            }
            op::VMADD_I32 => {
                let (acc, a, b) = r.three()?;
                Insn::VMaddI32 { acc, a, b }
            }
            op::VSUB_I32 => {
                let (dst, a, b) = r.three()?;
                Insn::VSubI32 { dst, a, b }
            }
            op::VADD => {
                let (dst, a, b) = r.three()?;
                Insn::VAdd { dst, a, b }
            }
            op::VSUB => {
                let (dst, a, b) = r.three()?;
                Insn::VSub { dst, a, b }
            }
            op::VMUL => {
                let (dst, a, b) = r.three()?;
                Insn::VMul { dst, a, b }
            }
            op::VMAX => {
                let (dst, a, b) = r.three()?;
                Insn::VMax { dst, a, b }
            }
            op::VMIN => {
                let (dst, a, b) = r.three()?;
                Insn::VMin { dst, a, b }
            }
            op::VSELECT_POS => Insn::VSelectPos {
                dst: r.vreg()?,
                cond: r.vreg()?,
                a: r.vreg()?,
                b: r.vreg()?,
            },
            op::VCVT_I32_F32 => Insn::VCvtI32F32 { dst: r.vreg()?, src: r.vreg()? },
            op::VCVT_F32_I32 => Insn::VCvtF32I32 { dst: r.vreg()?, src: r.vreg()? },
            other => return Err(r.err(format!("unknown opcode {other:#04x}"))),
        };
        program.push(insn);
        offsets.push(r.start);
    }
    Ok((program, offsets))
}
