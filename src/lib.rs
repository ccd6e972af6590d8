//! conv-jit-kernels: runtime-specialized convolution and elementwise kernels.
//!
//! Given one problem shape and one target vector width, the compiler emits a
//! single reusable routine instead of interpreting shape parameters at every
//! call:
//! - **Resolver**: picks register blocking, records channel tails and folds
//!   leading post-ops into accumulator initialization
//! - **Planner**: maps vector/scalar roles onto the target's register files
//!   with phase lifetimes, retrying smaller tiles on pressure
//! - **Generator**: emits boundary-free interior loops and static padded edge
//!   blocks, with fused store-time post-ops
//! - **Call contract**: `#[repr(C)]` parameter blocks with published field
//!   offsets and helpers that partition the iteration space
//!
//! # Quick Start
//!
//! ```
//! use conv_jit_kernels::compiler::{Activation, ConvAttr, ConvShape, ConvTensors, KernelCompiler, PostOp};
//! use conv_jit_kernels::types::{as_bytes, DataType};
//! use conv_jit_kernels::IsaLevel;
//!
//! let shape = ConvShape::new(19, 19, (5, 8), (3, 3))
//!     .pad(1)
//!     .types(DataType::U8, DataType::S8, DataType::U8);
//! let attr = ConvAttr::new()
//!     .post_op(PostOp::Bias)
//!     .post_op(PostOp::Activation(Activation::Clip { lo: 0.0, hi: 6.0 }));
//! let kernel = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
//!
//! let src = vec![1u8; shape.src_elems()];
//! let wei = vec![1i8; shape.wei_elems()];
//! let bias = vec![0.5f32; shape.oc];
//! let mut dst = vec![0u8; shape.dst_elems()];
//! let inputs = ConvTensors::new(&src, as_bytes(&wei)).bias(as_bytes(&bias));
//! kernel.forward(&inputs, &mut dst).unwrap();
//! assert_eq!(dst[0], 6);
//! ```

pub mod compiler;
pub mod reference;
pub mod types;

pub use compiler::codegen::{IsaLevel, TargetDesc};
pub use compiler::{
    ConvAttr, ConvBuffers, ConvCallParams, ConvConfig, ConvKernel, ConvShape, ConvTensors, EltwiseAlg,
    EltwiseCallParams, EltwiseDesc, EltwiseKernel, KernelCompiler, PostOp, Routine,
};
pub use types::{ConfigError, DataType, KernelError, Result};
