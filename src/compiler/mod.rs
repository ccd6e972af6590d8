//! Kernel compiler — runtime specialization of convolution and elementwise
//! kernels.
//!
//! The compiler takes a problem description, resolves a blocking
//! configuration for the target, plans registers, generates a routine and
//! pairs it with its configuration.
//!
//! # Pipeline
//!
//! ```text
//! ConvShape + ConvAttr → ConvConfig → RegisterAssignment → Routine → ConvKernel
//!                           ↑                ↑                ↑
//!                       config.rs       planner.rs       codegen/conv.rs
//!                           └──── retry on vector pressure ───┘
//!
//! EltwiseDesc → EltwiseConfig → RegisterAssignment → Routine → EltwiseKernel
//! ```

pub mod attr;
pub mod call_params;
pub mod codegen;
pub mod config;
pub mod eltwise;
pub mod executable;
pub mod parallel;
pub mod planner;
pub mod shape;
pub(crate) mod vm;

pub use attr::{Activation, BlockingHint, BoundsMode, ConvAttr, PostOp, ScaleMode};
pub use call_params::{
    conv_param_layout, eltwise_param_layout, ConvBuffers, ConvCallParams, EltwiseBuffers, EltwiseCallParams,
    ParamField,
};
pub use codegen::{CodegenOutput, IsaLevel, TargetDesc};
pub use config::{resolve, AccInit, AccumType, ConvConfig, StoreConversion, TailMode};
pub use eltwise::{resolve_eltwise, EltwiseAlg, EltwiseConfig, EltwiseDesc, PreluMode};
pub use executable::Routine;
pub use planner::{plan, plan_eltwise, RegisterAssignment};
pub use shape::ConvShape;

use log::{debug, warn};

use crate::types::{ConfigError, KernelError, RegClass, Result};

// ── Compiler ────────────────────────────────────────────────────────────

/// Drives resolve → plan → generate for one target.
///
/// Stateless apart from the target descriptor, so independent builds may
/// run concurrently from shared references.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelCompiler {
    target: TargetDesc,
}

type Reduction = fn(&ConvConfig) -> Option<ConvConfig>;

fn escalate(err: ConfigError) -> ConfigError {
    match err {
        ConfigError::RegisterPressure { .. } => ConfigError::Unsupported(format!("no blocking fits: {err}")),
        other => other,
    }
}

impl KernelCompiler {
    pub fn new(target: TargetDesc) -> Self {
        KernelCompiler { target }
    }

    pub fn for_isa(isa: IsaLevel) -> Self {
        Self::new(TargetDesc::for_isa(isa))
    }

    pub fn target(&self) -> &TargetDesc {
        &self.target
    }

    /// Plan `cfg`, shrinking the tile on vector pressure: at most one `ur_w`
    /// reduction, then one oc-blocking reduction.
    fn plan_with_retry(mut cfg: ConvConfig) -> std::result::Result<(ConvConfig, RegisterAssignment), ConfigError> {
        let reductions: [(&str, Reduction); 2] =
            [("ur_w", ConvConfig::reduce_ur_w), ("nb_oc_blocking", ConvConfig::reduce_oc_blocking)];
        let mut remaining = reductions.iter();
        loop {
            let err = match plan(&cfg) {
                Ok(regs) => return Ok((cfg, regs)),
                Err(e) => e,
            };
            if !matches!(err, ConfigError::RegisterPressure { class: RegClass::Vector, .. }) {
                return Err(escalate(err));
            }
            let Some((what, next)) = remaining.by_ref().find_map(|(what, reduce)| reduce(&cfg).map(|c| (what, c)))
            else {
                return Err(escalate(err));
            };
            warn!(
                "{err}; retrying with reduced {what}: ur_w {} → {}, nb_oc_blocking {} → {}",
                cfg.ur_w, next.ur_w, cfg.nb_oc_blocking, next.nb_oc_blocking
            );
            cfg = next;
        }
    }

    /// Build a convolution kernel.
    pub fn build_conv(&self, shape: &ConvShape, attr: &ConvAttr) -> std::result::Result<ConvKernel, ConfigError> {
        let cfg = resolve(shape, attr, &self.target)?;
        let (config, regs) = Self::plan_with_retry(cfg)?;
        let routine = codegen::generate(&config, &regs);
        debug!(
            "built conv kernel {:016x}: {} instructions, ur_w {}, nb_oc_blocking {}",
            routine.config_hash(),
            routine.instruction_count(),
            config.ur_w,
            config.nb_oc_blocking
        );
        Ok(ConvKernel { config, routine })
    }

    /// Build an elementwise kernel.
    pub fn build_eltwise(&self, desc: &EltwiseDesc) -> std::result::Result<EltwiseKernel, ConfigError> {
        let config = resolve_eltwise(desc, &self.target)?;
        let regs = plan_eltwise(&config).map_err(escalate)?;
        let routine = codegen::generate_eltwise(&config, &regs);
        debug!(
            "built eltwise kernel {:016x}: {} instructions, unroll {}",
            routine.config_hash(),
            routine.instruction_count(),
            config.unroll
        );
        Ok(EltwiseKernel { config, routine })
    }
}

fn check_len(name: &'static str, got: usize, needed: usize) -> Result<()> {
    if got < needed {
        return Err(KernelError::BufferTooSmall { name, needed, got });
    }
    Ok(())
}

fn check_operand(name: &'static str, buf: Option<&[u8]>, needed: usize) -> Result<*const u8> {
    match buf {
        Some(b) => check_len(name, b.len(), needed).map(|_| b.as_ptr()),
        None => Err(KernelError::BufferTooSmall { name, needed, got: 0 }),
    }
}

// ── Convolution ─────────────────────────────────────────────────────────

/// Input tensors of a convolution call, as raw bytes in their configured
/// types and layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvTensors<'a> {
    pub src: &'a [u8],
    pub weights: &'a [u8],
    pub bias: Option<&'a [u8]>,
    pub scales: Option<&'a [u8]>,
    pub compensation: Option<&'a [u8]>,
    pub residual: Option<&'a [u8]>,
}

impl<'a> ConvTensors<'a> {
    pub fn new(src: &'a [u8], weights: &'a [u8]) -> Self {
        ConvTensors { src, weights, ..Default::default() }
    }

    pub fn bias(mut self, bias: &'a [u8]) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn scales(mut self, scales: &'a [u8]) -> Self {
        self.scales = Some(scales);
        self
    }

    pub fn compensation(mut self, comp: &'a [u8]) -> Self {
        self.compensation = Some(comp);
        self
    }

    pub fn residual(mut self, residual: &'a [u8]) -> Self {
        self.residual = Some(residual);
        self
    }
}

/// A specialized convolution routine with the configuration it implements.
#[derive(Debug, Clone)]
pub struct ConvKernel {
    config: ConvConfig,
    routine: Routine,
}

impl ConvKernel {
    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    /// Run the routine on one parameter block.
    ///
    /// # Safety
    /// Every pointer in `params` must be valid for the slice the configuration
    /// implies for that call (see `ConvConfig::call_params`), and concurrent
    /// calls must write disjoint output slices.
    #[inline]
    pub unsafe fn execute(&self, params: &ConvCallParams) {
        self.routine.invoke(params as *const ConvCallParams as *const u8);
    }

    /// Check buffer sizes and collect base pointers.
    pub fn buffers(&self, t: &ConvTensors<'_>, dst: &mut [u8]) -> Result<ConvBuffers> {
        let s = &self.config.shape;
        check_len("src", t.src.len(), s.src_elems() * s.src_dt.size_bytes())?;
        check_len("weights", t.weights.len(), s.wei_elems() * s.wei_dt.size_bytes())?;
        let dst_bytes = s.dst_elems() * s.dst_dt.size_bytes();
        check_len("dst", dst.len(), dst_bytes)?;

        let mut bufs = ConvBuffers::new(t.src.as_ptr(), t.weights.as_ptr(), dst.as_mut_ptr());
        let per_channel = s.oc * 4;
        for op in &self.config.post_ops {
            match op {
                PostOp::Bias => bufs.bias = check_operand("bias", t.bias, per_channel)?,
                PostOp::Scale(ScaleMode::PerChannel) => bufs.scales = check_operand("scales", t.scales, per_channel)?,
                PostOp::Compensation => {
                    bufs.compensation = check_operand("compensation", t.compensation, per_channel)?
                }
                PostOp::Sum { .. } => bufs.residual = check_operand("residual", t.residual, dst_bytes)?,
                PostOp::Scale(ScaleMode::PerTensor(_)) | PostOp::Activation(_) => {}
            }
        }
        Ok(bufs)
    }

    /// Validate buffers and run every work item sequentially.
    pub fn forward(&self, t: &ConvTensors<'_>, dst: &mut [u8]) -> Result<()> {
        let bufs = self.buffers(t, dst)?;
        for i in 0..self.config.work_amount() {
            let (n, oh, g) = self.config.work_item(i);
            let p = self.config.call_params(&bufs, n, oh, g);
            // SAFETY: buffers were checked against the configuration above and
            // call_params offsets stay within them.
            unsafe { self.execute(&p) };
        }
        Ok(())
    }
}

// ── Elementwise ─────────────────────────────────────────────────────────

/// A specialized elementwise routine with its configuration.
#[derive(Debug, Clone)]
pub struct EltwiseKernel {
    config: EltwiseConfig,
    routine: Routine,
}

impl EltwiseKernel {
    pub fn config(&self) -> &EltwiseConfig {
        &self.config
    }

    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    /// Run the routine on one parameter block.
    ///
    /// # Safety
    /// Pointers in `params` must cover `work_amount` elements (rows for
    /// `PerChannel`) of every operand the algorithm reads or writes.
    #[inline]
    pub unsafe fn execute(&self, params: &EltwiseCallParams) {
        self.routine.invoke(params as *const EltwiseCallParams as *const u8);
    }

    /// Check buffer sizes and collect base pointers. `weights` is ignored by
    /// activations.
    pub fn buffers(&self, src: &[u8], weights: &[u8], dst: &mut [u8]) -> Result<EltwiseBuffers> {
        let d = &self.config.desc;
        check_len("src", src.len(), d.elems() * d.src_dt.size_bytes())?;
        check_len("weights", weights.len(), d.weight_elems() * 4)?;
        check_len("dst", dst.len(), d.elems() * d.dst_dt.size_bytes())?;
        Ok(EltwiseBuffers { src: src.as_ptr(), weights: weights.as_ptr(), dst: dst.as_mut_ptr() })
    }

    /// Validate buffers and run the whole tensor in `nthr` partitions.
    pub fn forward(&self, src: &[u8], weights: &[u8], dst: &mut [u8], nthr: usize) -> Result<()> {
        let bufs = self.buffers(src, weights, dst)?;
        for ithr in 0..nthr.max(1) {
            let range = self.config.partition(nthr.max(1), ithr);
            if range.is_empty() {
                continue;
            }
            let p = self.config.call_params(&bufs, range);
            // SAFETY: buffer sizes were checked and partitions stay in range.
            unsafe { self.execute(&p) };
        }
        Ok(())
    }
}
