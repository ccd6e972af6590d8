//! Executor for generated routines.
//!
//! Interprets a decoded virtual-ISA program against a call parameter block.
//! All machine state (vector and general register files) lives on the stack
//! of the invoking thread, so one program may run concurrently on any number
//! of threads. The executor performs no allocation and no bounds checking:
//! addresses come straight from the parameter block and the program.

use crate::compiler::codegen::insn::Insn;
use crate::compiler::codegen::simd_ops::{MemOperand, PARAM_GPR};
use crate::compiler::codegen::target_desc::{MAX_GPRS, MAX_LANES, MAX_VREGS};
use crate::types::DataType;

type Lanes = [u32; MAX_LANES];

#[inline(always)]
fn branch(pc: usize, rel: i32) -> usize {
    (pc as i64 + rel as i64) as usize
}

#[inline(always)]
fn addr(g: &[i64; MAX_GPRS], mem: MemOperand) -> *mut u8 {
    g[mem.base.0 as usize].wrapping_add(mem.offset as i64) as usize as *mut u8
}

#[inline(always)]
unsafe fn load_elem(p: *const u8, dt: DataType) -> u32 {
    #[cfg(test)]
    access_log::record(p, dt.size_bytes());
    match dt {
        DataType::F32 | DataType::S32 => std::ptr::read_unaligned(p as *const u32),
        DataType::S8 => (std::ptr::read(p as *const i8) as i32) as u32,
        DataType::U8 => std::ptr::read(p) as u32,
    }
}

#[inline(always)]
unsafe fn store_elem(p: *mut u8, dt: DataType, bits: u32) {
    #[cfg(test)]
    access_log::record(p, dt.size_bytes());
    match dt {
        DataType::F32 | DataType::S32 => std::ptr::write_unaligned(p as *mut u32, bits),
        DataType::S8 => std::ptr::write(p as *mut i8, (bits as i32).clamp(-128, 127) as i8),
        DataType::U8 => std::ptr::write(p, (bits as i32).clamp(0, 255) as u8),
    }
}

#[inline(always)]
fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// f32 → i32 with round-half-to-even; NaN and out-of-range inputs produce
/// `i32::MIN` (the x86 "integer indefinite" value).
#[inline]
pub(crate) fn cvt_f32_i32(x: f32) -> i32 {
    let r = x.round_ties_even();
    if r.is_nan() || r < -2147483648.0 || r >= 2147483648.0 {
        i32::MIN
    } else {
        r as i32
    }
}

/// Run `program` with `params` in the parameter register.
///
/// # Safety
/// The program must come from a generator whose configuration matches the
/// buffers referenced by `params`; every address the program computes must
/// be valid for the access it performs.
pub(crate) unsafe fn run(program: &[Insn], width: usize, params: *const u8) {
    debug_assert!(width <= MAX_LANES);
    let mut g = [0i64; MAX_GPRS];
    let mut v = [[0u32; MAX_LANES]; MAX_VREGS];
    g[PARAM_GPR.0 as usize] = params as usize as i64;

    macro_rules! lanewise {
        ($dst:expr, $a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {{
            let (ra, rb) = (v[$a.0 as usize], v[$b.0 as usize]);
            let mut out: Lanes = [0; MAX_LANES];
            for l in 0..width {
                let ($x, $y) = (ra[l], rb[l]);
                out[l] = $body;
            }
            v[$dst.0 as usize] = out;
        }};
    }

    let mut pc = 0usize;
    while let Some(&insn) = program.get(pc) {
        let mut next = pc + 1;
        match insn {
            Insn::Ret => return,
            Insn::Jmp { rel } => next = branch(pc, rel),
            Insn::DecJnz { reg, rel } => {
                let r = &mut g[reg.0 as usize];
                *r -= 1;
                if *r != 0 {
                    next = branch(pc, rel);
                }
            }
            Insn::CmpJlt { reg, imm, rel } => {
                if g[reg.0 as usize] < imm {
                    next = branch(pc, rel);
                }
            }
            Insn::CmpJge { reg, imm, rel } => {
                if g[reg.0 as usize] >= imm {
                    next = branch(pc, rel);
                }
            }
            Insn::GLoad { dst, mem } => {
                g[dst.0 as usize] = std::ptr::read_unaligned(addr(&g, mem) as *const isize) as i64;
            }
            Insn::GMovImm { dst, imm } => g[dst.0 as usize] = imm,
            Insn::GMov { dst, src } => g[dst.0 as usize] = g[src.0 as usize],
            Insn::GAddImm { dst, imm } => {
                g[dst.0 as usize] = g[dst.0 as usize].wrapping_add(imm);
            }
            Insn::GAdd { dst, src } => {
                g[dst.0 as usize] = g[dst.0 as usize].wrapping_add(g[src.0 as usize]);
            }
            Insn::VZero { dst } => v[dst.0 as usize] = [0; MAX_LANES],
            Insn::VMov { dst, src } => v[dst.0 as usize] = v[src.0 as usize],
            Insn::VConst { dst, bits } => v[dst.0 as usize] = [bits; MAX_LANES],
            Insn::VLoad { dst, mem, dt, mask } => {
                let base = addr(&g, mem) as *const u8;
                let m = mask.map(|m| v[m.0 as usize]);
                let mut out: Lanes = [0; MAX_LANES];
                for (l, lane) in out.iter_mut().enumerate().take(width) {
                    if m.map_or(true, |m| m[l] != 0) {
                        *lane = load_elem(base.wrapping_add(l * dt.size_bytes()), dt);
                    }
                }
                v[dst.0 as usize] = out;
            }
            Insn::VBroadcast { dst, mem, dt } => {
                let x = load_elem(addr(&g, mem), dt);
                v[dst.0 as usize] = [x; MAX_LANES];
            }
            Insn::VStore { src, mem, dt, mask } => {
                let base = addr(&g, mem);
                let m = mask.map(|m| v[m.0 as usize]);
                let data = v[src.0 as usize];
                for (l, &bits) in data.iter().enumerate().take(width) {
                    if m.map_or(true, |m| m[l] != 0) {
                        store_elem(base.wrapping_add(l * dt.size_bytes()), dt, bits);
                    }
                }
            }
            Insn::VMask { dst, lanes } => {
                let mut out: Lanes = [0; MAX_LANES];
                for lane in out.iter_mut().take(lanes as usize) {
                    *lane = u32::MAX;
                }
                v[dst.0 as usize] = out;
            }
            Insn::VFma { acc, a, b } => {
                let (ra, rb, rc) = (v[a.0 as usize], v[b.0 as usize], v[acc.0 as usize]);
                let mut out: Lanes = [0; MAX_LANES];
                for l in 0..width {
                    out[l] = f(ra[l]).mul_add(f(rb[l]), f(rc[l])).to_bits();
                }
                v[acc.0 as usize] = out;
            }
            Insn::VMaddI32 { acc, a, b } => {
                let (ra, rb, rc) = (v[a.0 as usize], v[b.0 as usize], v[acc.0 as usize]);
                let mut out: Lanes = [0; MAX_LANES];
                for l in 0..width {
                    let prod = (ra[l] as i32).wrapping_mul(rb[l] as i32);
                    out[l] = (rc[l] as i32).wrapping_add(prod) as u32;
                }
                v[acc.0 as usize] = out;
            }
            Insn::VSubI32 { dst, a, b } => {
                lanewise!(dst, a, b, |x, y| (x as i32).wrapping_sub(y as i32) as u32)
            }
            Insn::VAdd { dst, a, b } => lanewise!(dst, a, b, |x, y| (f(x) + f(y)).to_bits()),
            Insn::VSub { dst, a, b } => lanewise!(dst, a, b, |x, y| (f(x) - f(y)).to_bits()),
            Insn::VMul { dst, a, b } => lanewise!(dst, a, b, |x, y| (f(x) * f(y)).to_bits()),
            Insn::VMax { dst, a, b } => lanewise!(dst, a, b, |x, y| f(x).max(f(y)).to_bits()),
            Insn::VMin { dst, a, b } => lanewise!(dst, a, b, |x, y| f(x).min(f(y)).to_bits()),
            Insn::VSelectPos { dst, cond, a, b } => {
                let (rc, ra, rb) = (v[cond.0 as usize], v[a.0 as usize], v[b.0 as usize]);
                let mut out: Lanes = [0; MAX_LANES];
                for l in 0..width {
                    out[l] = if f(rc[l]) > 0.0 { ra[l] } else { rb[l] };
                }
                v[dst.0 as usize] = out;
            }
            Insn::VCvtI32F32 { dst, src } => {
                let rs = v[src.0 as usize];
                let mut out: Lanes = [0; MAX_LANES];
                for l in 0..width {
                    out[l] = (rs[l] as i32 as f32).to_bits();
                }
                v[dst.0 as usize] = out;
            }
            Insn::VCvtF32I32 { dst, src } => {
                let rs = v[src.0 as usize];
                let mut out: Lanes = [0; MAX_LANES];
                for l in 0..width {
                    out[l] = cvt_f32_i32(f(rs[l])) as u32;
                }
                v[dst.0 as usize] = out;
            }
        }
        pc = next;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::assembler::Assembler;
    use crate::compiler::codegen::simd_ops::{Gpr, MemOperand, SimdOps, VReg};

    #[repr(C)]
    struct Params {
        src: *const f32,
        dst: *mut u8,
        count: usize,
    }

    #[test]
    fn test_cvt_rounds_half_to_even() {
        assert_eq!(cvt_f32_i32(2.5), 2);
        assert_eq!(cvt_f32_i32(3.5), 4);
        assert_eq!(cvt_f32_i32(-2.5), -2);
        assert_eq!(cvt_f32_i32(f32::NAN), i32::MIN);
        assert_eq!(cvt_f32_i32(3.0e9), i32::MIN);
    }

    #[test]
    fn test_masked_load_store_and_saturation() {
        // dst[i] = sat_u8(src[i] * 100) for the first 3 lanes only.
        let mut asm = Assembler::new(4);
        let src = Gpr(1);
        let dst = Gpr(2);
        asm.gpr_load(src, MemOperand::new(Gpr(0), 0));
        asm.gpr_load(dst, MemOperand::new(Gpr(0), 8));
        asm.vmask(VReg(3), 3);
        asm.vload(VReg(0), MemOperand::new(src, 0), DataType::F32, Some(VReg(3)));
        asm.vbroadcast_const(VReg(1), 100.0);
        asm.vmul(VReg(0), VReg(0), VReg(1));
        asm.vcvt_f32_i32(VReg(0), VReg(0));
        asm.vstore(MemOperand::new(dst, 0), VReg(0), DataType::U8, Some(VReg(3)));
        asm.ret();
        let program = asm.finalize();

        let input = [0.5f32, 9.0, -1.0];
        let mut out = [7u8; 4];
        let p = Params { src: input.as_ptr(), dst: out.as_mut_ptr(), count: 3 };
        unsafe { run(&program, 4, &p as *const Params as *const u8) };
        assert_eq!(out, [50, 255, 0, 7]);
        assert_eq!(p.count, 3);
    }

    #[test]
    fn test_counted_loop_accumulates() {
        // acc += broadcast(x) four times, then store.
        let mut asm = Assembler::new(8);
        let cnt = Gpr(1);
        let ptr = Gpr(2);
        asm.gpr_load(ptr, MemOperand::new(Gpr(0), 0));
        asm.gpr_load_imm(cnt, 4);
        asm.vzero(VReg(0));
        let top = asm.alloc_label();
        asm.define_label(top);
        asm.vbroadcast(VReg(1), MemOperand::new(ptr, 0), DataType::S8);
        asm.vbroadcast_const(VReg(2), 1.0);
        asm.vcvt_i32_f32(VReg(1), VReg(1));
        asm.vfma(VReg(0), VReg(1), VReg(2));
        asm.dec_and_branch_nz(cnt, top);
        asm.vstore(MemOperand::new(ptr, 4), VReg(0), DataType::F32, None);
        asm.ret();
        let program = asm.finalize();

        #[repr(C)]
        struct Buf {
            x: [i8; 4],
            out: [f32; 8],
        }
        let mut buf = Buf { x: [-3, 0, 0, 0], out: [0.0; 8] };
        let base = &mut buf as *mut Buf as *mut u8;
        let params = [base as usize];
        unsafe { run(&program, 8, params.as_ptr() as *const u8) };
        assert_eq!(buf.out, [-12.0; 8]);
    }
}
