//! Code generation for specialized kernels.
//!
//! Kernel builders emit through the `SimdOps` interface into an `Assembler`,
//! which resolves labels and encodes a position-independent routine.
//!
//! - `conv.rs`: direct and depthwise convolution row kernels
//! - `eltwise.rs`: PReLU / activation kernels
//! - `postops.rs`: fused store-time operations shared by both families

pub mod assembler;
pub mod conv;
pub mod eltwise;
pub mod insn;
pub mod postops;
pub mod simd_ops;
pub mod target_desc;

pub use assembler::Assembler;
pub use conv::generate;
pub use eltwise::generate_eltwise;
pub use simd_ops::{Gpr, Label, MemOperand, SimdOps, VReg};
pub use target_desc::{IsaLevel, TargetDesc};

/// Output of code generation: the encoded routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOutput {
    /// Encoded instruction stream
    pub code: Vec<u8>,
    /// Number of instructions in `code`
    pub instructions: usize,
    /// Required scratchpad size in bytes
    pub scratchpad_bytes: usize,
}
