//! SimdOps trait — virtual SIMD instruction set for kernel code generation.
//!
//! Kernel builders (`conv.rs`, `eltwise.rs`, `postops.rs`) generate code by
//! calling methods on `SimdOps`. The backend in `assembler.rs` records the
//! calls into an encoded instruction stream; a native backend would emit real
//! machine instructions behind the same interface.
//!
//! Register conventions:
//! - `VReg` / `Gpr` are physical indices chosen by the register planner.
//! - `Gpr(0)` holds the call parameter block pointer at routine entry.
//! - Vector lanes are 32 bits wide; integer element types are widened to i32
//!   lanes on load and narrowed with saturation on store.
//!
//! Methods are infallible. Every register, lane count and label reaching the
//! backend comes from a verified `RegisterAssignment` and a resolved
//! configuration, so misuse (a label bound twice or never, a mask wider than
//! the vector) is a generator bug and the backend asserts on it. Conditions a
//! caller can trigger are reported earlier as `ConfigError` by the resolver
//! and planner.

use crate::types::DataType;

/// Vector register (index into the target's vector register file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u8);

/// General-purpose (scalar) register holding pointers and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gpr(pub u8);

/// Register holding the call parameter block pointer at entry.
pub const PARAM_GPR: Gpr = Gpr(0);

/// Memory operand `[base + offset]` (byte offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub base: Gpr,
    pub offset: i32,
}

impl MemOperand {
    #[inline]
    pub fn new(base: Gpr, offset: i32) -> Self {
        MemOperand { base, offset }
    }
}

/// Label for branch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Platform-agnostic SIMD instruction interface.
pub trait SimdOps {
    // ── Vector data movement ────────────────────────────────────────────

    /// dst = all zeros
    fn vzero(&mut self, dst: VReg);
    /// dst = src
    fn vmov(&mut self, dst: VReg, src: VReg);
    /// dst = broadcast compile-time f32 constant to all lanes
    fn vbroadcast_const(&mut self, dst: VReg, val: f32);
    /// dst = load one vector of `dt` elements, widened to 32-bit lanes.
    /// With a mask, inactive lanes are neither read nor kept (zeroed).
    fn vload(&mut self, dst: VReg, mem: MemOperand, dt: DataType, mask: Option<VReg>);
    /// dst = broadcast one `dt` element, widened, to all lanes
    fn vbroadcast(&mut self, dst: VReg, mem: MemOperand, dt: DataType);
    /// Store src lanes as `dt` elements (integer types saturate from i32).
    /// With a mask, inactive lanes are not written.
    fn vstore(&mut self, mem: MemOperand, src: VReg, dt: DataType, mask: Option<VReg>);
    /// dst = lane mask with the first `lanes` lanes active
    fn vmask(&mut self, dst: VReg, lanes: usize);

    // ── Vector arithmetic ───────────────────────────────────────────────

    /// acc = a * b + acc  (f32, single rounding)
    fn vfma(&mut self, acc: VReg, a: VReg, b: VReg);
    /// acc = acc + a * b  (i32, wrapping)
    fn vmadd_i32(&mut self, acc: VReg, a: VReg, b: VReg);
    /// dst = a - b  (i32, wrapping)
    fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = a + b
    fn vadd(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = a - b
    fn vsub(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = a * b
    fn vmul(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = max(a, b)
    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = min(a, b)
    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg);
    /// dst = cond > 0 ? a : b  (per lane, f32 compare)
    fn vselect_pos(&mut self, dst: VReg, cond: VReg, a: VReg, b: VReg);
    /// dst = convert i32 lanes to f32
    fn vcvt_i32_f32(&mut self, dst: VReg, src: VReg);
    /// dst = convert f32 lanes to i32, rounding half to even
    fn vcvt_f32_i32(&mut self, dst: VReg, src: VReg);

    // ── Loop control ────────────────────────────────────────────────────

    /// Allocate a new label (returns unique label ID).
    fn alloc_label(&mut self) -> Label;
    /// Define a label at the current code position.
    fn define_label(&mut self, label: Label);
    /// Unconditional jump to label.
    fn jump(&mut self, label: Label);
    /// Decrement GPR and branch to label if non-zero.
    fn dec_and_branch_nz(&mut self, counter: Gpr, label: Label);
    /// Compare GPR to immediate and branch if less than.
    fn cmp_and_branch_lt(&mut self, reg: Gpr, imm: i64, label: Label);
    /// Compare GPR to immediate and branch if greater-or-equal.
    fn cmp_and_branch_ge(&mut self, reg: Gpr, imm: i64, label: Label);

    // ── GPR operations ──────────────────────────────────────────────────

    /// dst = pointer-sized value at mem
    fn gpr_load(&mut self, dst: Gpr, mem: MemOperand);
    /// dst = imm
    fn gpr_load_imm(&mut self, dst: Gpr, imm: i64);
    /// dst = dst + imm
    fn gpr_add_imm(&mut self, dst: Gpr, imm: i64);
    /// dst = dst + src
    fn gpr_add(&mut self, dst: Gpr, src: Gpr);
    /// dst = src
    fn gpr_mov(&mut self, dst: Gpr, src: Gpr);

    // ── Function frame ──────────────────────────────────────────────────

    /// Return to the caller.
    fn ret(&mut self);
}
