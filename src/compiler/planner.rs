//! Register planner — assigns physical registers to logical kernel roles.
//!
//! Roles are allocated in a fixed priority order from a pool per register
//! file. Each role carries a lifetime over the generation phases of one
//! output tile; a register already holding a role is reused only when no
//! existing occupant's lifetime overlaps the new one (greedy coloring over
//! phase sets). Allocation failure is an explicit `RegisterPressure`.

use std::fmt;

use log::debug;

use crate::compiler::attr::BoundsMode;
use crate::compiler::codegen::simd_ops::{Gpr, VReg, PARAM_GPR};
use crate::compiler::config::ConvConfig;
use crate::compiler::eltwise::{EltwiseAlg, EltwiseConfig, PreluMode};
use crate::types::{ConfigError, RegClass};

// ── Lifetimes ───────────────────────────────────────────────────────

/// Generation phase of one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Accumulate,
    Store,
}

/// Set of phases during which a role holds a live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime(u8);

impl Lifetime {
    pub const INIT: Lifetime = Lifetime(1 << 0);
    pub const ACCUMULATE: Lifetime = Lifetime(1 << 1);
    pub const STORE: Lifetime = Lifetime(1 << 2);
    pub const ALL: Lifetime = Lifetime(0b111);

    pub const fn union(self, other: Lifetime) -> Lifetime {
        Lifetime(self.0 | other.0)
    }

    #[inline]
    pub fn overlaps(self, other: Lifetime) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, phase: Phase) -> bool {
        let bit = match phase {
            Phase::Init => Self::INIT,
            Phase::Accumulate => Self::ACCUMULATE,
            Phase::Store => Self::STORE,
        };
        self.overlaps(bit)
    }
}

// ── Roles ───────────────────────────────────────────────────────────

/// Logical vector register role.
///
/// Elementwise kernels use `Acc { pos: u, block: 0 }` for the data vector of
/// unroll slot `u` and `Weight(u)` for its slope / temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VRole {
    Acc { pos: usize, block: usize },
    Weight(usize),
    Input,
    /// Constants for conversion and activations.
    Scratch,
    /// Just-in-time post-op operand.
    Operand,
    Mask,
}

impl VRole {
    /// Lifetime of the role in a convolution tile.
    pub fn lifetime(&self) -> Lifetime {
        match self {
            VRole::Acc { .. } | VRole::Mask => Lifetime::ALL,
            VRole::Weight(_) | VRole::Input => Lifetime::ACCUMULATE,
            VRole::Scratch => Lifetime::STORE,
            VRole::Operand => Lifetime::INIT.union(Lifetime::STORE),
        }
    }
}

/// Logical scalar register role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GRole {
    /// Call parameter block pointer (always `Gpr(0)`).
    Params,
    /// Input pointer at the current output-column block.
    SrcOw,
    /// Byte offset of the current output-column block within the dst row.
    OutOff,
    OwCount,
    SrcIcb,
    WeiIcb,
    IcbCount,
    SrcKh,
    WeiKh,
    KhCount,
    /// Input row index (naive bounds mode).
    Ih,
    /// Elementwise source pointer.
    Src,
    /// Elementwise destination pointer.
    Dst,
    /// Elementwise weight pointer.
    Wei,
    /// Remaining elementwise work (elements or rows).
    Work,
    /// Short-lived base pointer.
    Tmp,
}

impl fmt::Display for VRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VRole::Acc { pos, block } => write!(f, "acc[{pos}][{block}]"),
            VRole::Weight(b) => write!(f, "weight[{b}]"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────

/// One register file with per-register occupant lifetimes.
struct RegisterPool {
    class: RegClass,
    occupants: Vec<Vec<Lifetime>>,
    demanded: usize,
}

impl RegisterPool {
    fn new(class: RegClass, size: usize) -> Self {
        RegisterPool { class, occupants: vec![Vec::new(); size], demanded: 0 }
    }

    /// Lowest register whose occupants are all disjoint from `lt`.
    fn alloc(&mut self, lt: Lifetime) -> Option<u8> {
        self.demanded += 1;
        let idx = self
            .occupants
            .iter()
            .position(|occ| occ.iter().all(|o| !o.overlaps(lt)))?;
        self.occupants[idx].push(lt);
        Some(idx as u8)
    }

    fn pressure(&self, needed: usize) -> ConfigError {
        ConfigError::RegisterPressure { class: self.class, needed, available: self.occupants.len() }
    }
}

// ── Assignment ──────────────────────────────────────────────────────

/// Total, conflict-free mapping from roles to physical registers.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterAssignment {
    pub vregs: Vec<(VRole, Lifetime, VReg)>,
    pub gprs: Vec<(GRole, Gpr)>,
    pub num_vregs: usize,
    pub num_gprs: usize,
}

impl RegisterAssignment {
    pub fn try_vreg(&self, role: VRole) -> Option<VReg> {
        self.vregs.iter().find(|(r, _, _)| *r == role).map(|&(_, _, v)| v)
    }

    /// Physical register of a planned vector role.
    ///
    /// # Panics
    /// If the role was not planned; generators only request planned roles.
    pub fn vreg(&self, role: VRole) -> VReg {
        self.try_vreg(role).unwrap_or_else(|| panic!("no vector register planned for {role}"))
    }

    pub fn acc(&self, pos: usize, block: usize) -> VReg {
        self.vreg(VRole::Acc { pos, block })
    }

    pub fn weight(&self, block: usize) -> VReg {
        self.vreg(VRole::Weight(block))
    }

    pub fn gpr(&self, role: GRole) -> Gpr {
        self.gprs
            .iter()
            .find(|(r, _)| *r == role)
            .map(|&(_, g)| g)
            .unwrap_or_else(|| panic!("no general register planned for {role:?}"))
    }

    /// Distinct vector registers in use.
    pub fn vregs_used(&self) -> usize {
        let mut regs: Vec<u8> = self.vregs.iter().map(|(_, _, v)| v.0).collect();
        regs.sort_unstable();
        regs.dedup();
        regs.len()
    }

    /// Re-check the assignment invariants: every index inside its file, each
    /// role planned once, and registers shared only by disjoint lifetimes.
    pub fn verify(&self) -> Result<(), String> {
        for (i, (role, lt, reg)) in self.vregs.iter().enumerate() {
            if reg.0 as usize >= self.num_vregs {
                return Err(format!("{role} mapped to v{} outside a {}-register file", reg.0, self.num_vregs));
            }
            for (other, olt, oreg) in &self.vregs[i + 1..] {
                if other == role {
                    return Err(format!("{role} planned twice"));
                }
                if oreg == reg && olt.overlaps(*lt) {
                    return Err(format!("{role} and {other} share v{} with overlapping lifetimes", reg.0));
                }
            }
        }
        for (i, (role, reg)) in self.gprs.iter().enumerate() {
            if reg.0 as usize >= self.num_gprs {
                return Err(format!("{role:?} mapped to g{} outside a {}-register file", reg.0, self.num_gprs));
            }
            if let Some((other, _)) = self.gprs[i + 1..].iter().find(|(o, r)| o == role || r == reg) {
                return Err(format!("{role:?} collides with {other:?} on g{}", reg.0));
            }
        }
        match self.gprs.first() {
            Some(&(GRole::Params, g)) if g == PARAM_GPR => Ok(()),
            _ => Err("parameter block pointer must be the first scalar role in g0".into()),
        }
    }
}

/// Builds an assignment in priority order.
struct Planner {
    vpool: RegisterPool,
    gpool: RegisterPool,
    vregs: Vec<(VRole, Lifetime, VReg)>,
    gprs: Vec<(GRole, Gpr)>,
    vfailed: bool,
}

impl Planner {
    fn new(num_vregs: usize, num_gprs: usize) -> Self {
        Planner {
            vpool: RegisterPool::new(RegClass::Vector, num_vregs),
            gpool: RegisterPool::new(RegClass::Scalar, num_gprs),
            vregs: Vec::new(),
            gprs: Vec::new(),
            vfailed: false,
        }
    }

    fn vector(&mut self, role: VRole, lt: Lifetime) {
        match self.vpool.alloc(lt) {
            Some(idx) => self.vregs.push((role, lt, VReg(idx))),
            None => self.vfailed = true,
        }
    }

    fn scalar(&mut self, roles: &[GRole]) -> Result<(), ConfigError> {
        if roles.len() > self.gpool.occupants.len() {
            return Err(self.gpool.pressure(roles.len()));
        }
        for &role in roles {
            let idx = self.gpool.alloc(Lifetime::ALL).ok_or_else(|| self.gpool.pressure(roles.len()))?;
            self.gprs.push((role, Gpr(idx)));
        }
        Ok(())
    }

    fn finish(self) -> Result<RegisterAssignment, ConfigError> {
        if self.vfailed {
            return Err(self.vpool.pressure(self.vpool.demanded));
        }
        let assignment = RegisterAssignment {
            vregs: self.vregs,
            gprs: self.gprs,
            num_vregs: self.vpool.occupants.len(),
            num_gprs: self.gpool.occupants.len(),
        };
        debug_assert_eq!(assignment.verify(), Ok(()));
        Ok(assignment)
    }
}

/// Plan registers for a convolution configuration.
///
/// Priority: accumulators, weight tile, input, scratch, operand (if a post-op
/// or folded initialization needs one), mask (if an oc tail exists), then the
/// scalar roles.
pub fn plan(cfg: &ConvConfig) -> Result<RegisterAssignment, ConfigError> {
    let mut p = Planner::new(cfg.target.num_vregs, cfg.target.num_gprs);
    let nb = cfg.nb_oc_blocking;
    for pos in 0..cfg.ur_w {
        for block in 0..nb {
            p.vector(VRole::Acc { pos, block }, Lifetime::ALL);
        }
    }
    for block in 0..nb {
        p.vector(VRole::Weight(block), VRole::Weight(block).lifetime());
    }
    for role in [VRole::Input, VRole::Scratch] {
        p.vector(role, role.lifetime());
    }
    if cfg.needs_operand() {
        p.vector(VRole::Operand, VRole::Operand.lifetime());
    }
    if cfg.needs_mask() {
        p.vector(VRole::Mask, Lifetime::ALL);
    }

    let mut scalars = vec![
        GRole::Params,
        GRole::SrcOw,
        GRole::OutOff,
        GRole::OwCount,
        GRole::SrcIcb,
        GRole::WeiIcb,
        GRole::IcbCount,
        GRole::SrcKh,
        GRole::WeiKh,
        GRole::KhCount,
    ];
    if cfg.bounds == BoundsMode::Naive {
        scalars.push(GRole::Ih);
    }
    scalars.push(GRole::Tmp);
    p.scalar(&scalars)?;

    let assignment = p.finish()?;
    debug!(
        "planned conv registers: {} vector ({} roles), {} scalar",
        assignment.vregs_used(),
        assignment.vregs.len(),
        assignment.gprs.len()
    );
    Ok(assignment)
}

/// Plan registers for an elementwise configuration. All roles live for the
/// whole routine.
pub fn plan_eltwise(cfg: &EltwiseConfig) -> Result<RegisterAssignment, ConfigError> {
    let mut p = Planner::new(cfg.target.num_vregs, cfg.target.num_gprs);
    for u in 0..cfg.unroll {
        p.vector(VRole::Acc { pos: u, block: 0 }, Lifetime::ALL);
        p.vector(VRole::Weight(u), Lifetime::ALL);
    }
    p.vector(VRole::Scratch, Lifetime::ALL);
    if matches!(cfg.desc.alg, EltwiseAlg::Prelu(PreluMode::PerTensor)) {
        p.vector(VRole::Operand, Lifetime::ALL);
    }
    if cfg.needs_mask() {
        p.vector(VRole::Mask, Lifetime::ALL);
    }
    p.scalar(&[GRole::Params, GRole::Src, GRole::Dst, GRole::Wei, GRole::Work])?;
    let assignment = p.finish()?;
    debug!("planned eltwise registers: {} vector, unroll {}", assignment.vregs_used(), cfg.unroll);
    Ok(assignment)
}
