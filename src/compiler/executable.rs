//! Routine — an encoded, immutable kernel plus its decoded program.
//!
//! A `Routine` owns the position-independent byte sequence produced by code
//! generation and the program decoded from it. Invocation hands a pointer to a
//! call parameter block to the executor; all machine state lives on the
//! calling thread's stack, so one routine may be invoked concurrently.

use crate::compiler::codegen::insn::{decode_for_width, Insn};
use crate::compiler::codegen::target_desc::TargetDesc;
use crate::compiler::codegen::CodegenOutput;
use crate::compiler::vm;
use crate::types::KernelError;

/// A generated kernel routine.
#[derive(Debug, Clone)]
pub struct Routine {
    code: Vec<u8>,
    program: Vec<Insn>,
    /// Entry point (instruction index) within the program
    entry_offset: usize,
    simd_width: usize,
    scratchpad_bytes: usize,
    config_hash: u64,
}

impl Routine {
    /// Decode a routine from encoded bytes.
    pub fn from_code(
        code_bytes: &[u8],
        simd_width: usize,
        scratchpad_bytes: usize,
        config_hash: u64,
    ) -> Result<Self, KernelError> {
        TargetDesc { simd_width, ..TargetDesc::default() }.validate()?;
        let program = decode_for_width(code_bytes, simd_width)?;
        if program.last() != Some(&Insn::Ret) {
            return Err(KernelError::Decode {
                offset: code_bytes.len(),
                reason: "routine does not end in ret".into(),
            });
        }
        Ok(Routine {
            code: code_bytes.to_vec(),
            program,
            entry_offset: 0,
            simd_width,
            scratchpad_bytes,
            config_hash,
        })
    }

    /// Wrap freshly generated code without a decode round trip.
    pub(crate) fn from_parts(
        output: CodegenOutput,
        program: Vec<Insn>,
        simd_width: usize,
        config_hash: u64,
    ) -> Self {
        debug_assert_eq!(output.instructions, program.len());
        Routine {
            code: output.code,
            program,
            entry_offset: 0,
            simd_width,
            scratchpad_bytes: output.scratchpad_bytes,
            config_hash,
        }
    }

    /// Encoded instruction bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Size of the encoded routine in bytes.
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Decoded program.
    pub fn program(&self) -> &[Insn] {
        &self.program
    }

    pub fn instruction_count(&self) -> usize {
        self.program.len()
    }

    pub fn simd_width(&self) -> usize {
        self.simd_width
    }

    /// Scratchpad bytes the caller must provide. No current kernel needs one.
    pub fn scratchpad_bytes(&self) -> usize {
        self.scratchpad_bytes
    }

    /// Hash of the configuration this routine was generated for.
    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Execute the routine.
    ///
    /// # Safety
    /// `params` must point to the call parameter block type the routine was
    /// generated for, and every buffer it references must cover the ranges
    /// the routine's configuration implies for this call.
    #[inline]
    pub unsafe fn invoke(&self, params: *const u8) {
        vm::run(&self.program[self.entry_offset..], self.simd_width, params);
    }
}

/// FNV-1a hash of a configuration descriptor and the target it was built for.
pub fn config_hash(desc: &[u8], target: &TargetDesc) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // FNV offset basis
    let target_desc = format!("w{}_v{}_g{}", target.simd_width, target.num_vregs, target.num_gprs);
    for &b in desc.iter().chain(target_desc.as_bytes()) {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3); // FNV prime
    }
    h
}

// Routines are plain data; the executor keeps all mutable state on the stack.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Routine>();
};
