//! Scalar reference — straightforward loops with the generated kernels'
//! numeric rules.
//!
//! Accumulation order per output element is ic block → kernel row → kernel
//! column → input channel, skipping taps outside the input; f32 products use
//! fused multiply-add, integer products wrapping i32 arithmetic. Leading-op
//! folding, post-op order, clamping and half-to-even rounding follow the
//! resolved configuration, so results are bit-identical to the routines.

use std::ops::Range;

use crate::compiler::attr::{PostOp, ScaleMode};
use crate::compiler::config::{AccInit, AccumType, ConvConfig, StoreConversion};
use crate::compiler::eltwise::{EltwiseAlg, EltwiseDesc, PreluMode};
use crate::compiler::ConvTensors;
use crate::types::DataType;

// ── Element access ──────────────────────────────────────────────────────

fn read_f32(buf: &[u8], i: usize) -> f32 {
    bytemuck::pod_read_unaligned(&buf[i * 4..i * 4 + 4])
}

fn read_i32(buf: &[u8], i: usize) -> i32 {
    bytemuck::pod_read_unaligned(&buf[i * 4..i * 4 + 4])
}

/// Integer element widened to i32.
fn read_int(buf: &[u8], dt: DataType, i: usize) -> i32 {
    match dt {
        DataType::S8 => buf[i] as i8 as i32,
        DataType::U8 => buf[i] as i32,
        DataType::S32 => read_i32(buf, i),
        DataType::F32 => panic!("f32 element read as integer"),
    }
}

/// Element of any type as f32.
fn read_value(buf: &[u8], dt: DataType, i: usize) -> f32 {
    match dt {
        DataType::F32 => read_f32(buf, i),
        dt => read_int(buf, dt, i) as f32,
    }
}

fn write_int(buf: &mut [u8], dt: DataType, i: usize, v: i32) {
    match dt {
        DataType::S8 => buf[i] = v.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8,
        DataType::U8 => buf[i] = v.clamp(0, u8::MAX as i32) as u8,
        DataType::S32 => buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes()),
        DataType::F32 => panic!("integer written to f32 element"),
    }
}

/// Store an f32 result into `dt`: f32 as is, integers clamped to the type's
/// range and rounded half to even.
fn store_value(buf: &mut [u8], dt: DataType, i: usize, x: f32) {
    match dt.saturation_bounds() {
        None => buf[i * 4..i * 4 + 4].copy_from_slice(&x.to_ne_bytes()),
        Some((lo, hi)) => write_int(buf, dt, i, x.max(lo).min(hi).round_ties_even() as i32),
    }
}

// ── Convolution ─────────────────────────────────────────────────────────

/// Input-channel chunks in the order the routine visits them.
fn ic_chunks(cfg: &ConvConfig) -> Vec<Range<usize>> {
    let b = cfg.ic_block;
    (0..cfg.nb_ic)
        .map(|i| i * b..(i + 1) * b)
        .chain((cfg.ic_tail > 0).then(|| cfg.nb_ic * b..cfg.nb_ic * b + cfg.ic_tail))
        .collect()
}

/// Reference convolution for a resolved configuration. Panics if a buffer
/// the configuration reads is missing or short.
pub fn conv_forward(cfg: &ConvConfig, t: &ConvTensors<'_>, dst: &mut [u8]) {
    let s = &cfg.shape;
    let (oh_n, ow_n) = (cfg.oh, cfg.ow);
    let chunks = ic_chunks(cfg);
    let per_channel = |buf: Option<&[u8]>, name: &str, oc: usize| -> f32 {
        let buf = buf.unwrap_or_else(|| panic!("missing {name} buffer"));
        read_f32(buf, oc)
    };
    let comp = |oc: usize| -> i32 {
        let buf = t.compensation.unwrap_or_else(|| panic!("missing compensation buffer"));
        read_i32(buf, oc)
    };

    for n in 0..s.batch {
        for oh in 0..oh_n {
            for ow in 0..ow_n {
                // Valid (kh, ih) and (kw, iw) taps.
                let rows: Vec<(usize, usize)> = (0..s.kh)
                    .filter_map(|kh| {
                        let ih = (oh * s.stride_h + kh * s.dil_h).checked_sub(s.pad_t)?;
                        (ih < s.ih).then_some((kh, ih))
                    })
                    .collect();
                let cols: Vec<(usize, usize)> = (0..s.kw)
                    .filter_map(|kw| {
                        let iw = (ow * s.stride_w + kw * s.dil_w).checked_sub(s.pad_l)?;
                        (iw < s.iw).then_some((kw, iw))
                    })
                    .collect();
                let src_idx = |ih: usize, iw: usize, c: usize| ((n * s.ih + ih) * s.iw + iw) * s.ic + c;

                for oc in 0..s.oc {
                    let dst_idx = ((n * oh_n + oh) * ow_n + ow) * s.oc + oc;
                    let wei_idx = |kh: usize, kw: usize, ic: usize| {
                        if cfg.is_depthwise() {
                            (kh * s.kw + kw) * s.oc + oc
                        } else {
                            ((kh * s.kw + kw) * s.ic + ic) * s.oc + oc
                        }
                    };
                    let taps = || -> Vec<(usize, usize)> {
                        // (src index, weight index) in accumulation order
                        let mut v = Vec::new();
                        if cfg.is_depthwise() {
                            for &(kh, ih) in &rows {
                                for &(kw, iw) in &cols {
                                    v.push((src_idx(ih, iw, oc), wei_idx(kh, kw, 0)));
                                }
                            }
                        } else {
                            for chunk in &chunks {
                                for &(kh, ih) in &rows {
                                    for &(kw, iw) in &cols {
                                        for ic in chunk.clone() {
                                            v.push((src_idx(ih, iw, ic), wei_idx(kh, kw, ic)));
                                        }
                                    }
                                }
                            }
                        }
                        v
                    };

                    let x = match cfg.accum {
                        AccumType::F32 => {
                            let mut acc = match cfg.init {
                                AccInit::Bias => per_channel(t.bias, "bias", oc),
                                _ => 0.0,
                            };
                            for (si, wi) in taps() {
                                acc = read_f32(t.src, si).mul_add(read_f32(t.weights, wi), acc);
                            }
                            acc
                        }
                        AccumType::S32 => {
                            let mut acc = match cfg.init {
                                AccInit::NegCompensation => 0i32.wrapping_sub(comp(oc)),
                                _ => 0,
                            };
                            for (si, wi) in taps() {
                                let prod = read_int(t.src, s.src_dt, si).wrapping_mul(read_int(t.weights, s.wei_dt, wi));
                                acc = acc.wrapping_add(prod);
                            }
                            if cfg.store == StoreConversion::Raw {
                                write_int(dst, s.dst_dt, dst_idx, acc);
                                continue;
                            }
                            acc as f32
                        }
                    };

                    let mut x = x;
                    for op in &cfg.store_ops {
                        x = match *op {
                            PostOp::Scale(ScaleMode::PerTensor(f)) => x * f,
                            PostOp::Scale(ScaleMode::PerChannel) => x * per_channel(t.scales, "scales", oc),
                            PostOp::Bias => x + per_channel(t.bias, "bias", oc),
                            PostOp::Compensation => x - comp(oc) as f32,
                            PostOp::Activation(act) => act.apply(x),
                            PostOp::Sum { scale } => {
                                let res = t.residual.unwrap_or_else(|| panic!("missing residual buffer"));
                                let mut r = read_value(res, s.dst_dt, dst_idx);
                                if scale != 1.0 {
                                    r *= scale;
                                }
                                x + r
                            }
                        };
                    }
                    store_value(dst, s.dst_dt, dst_idx, x);
                }
            }
        }
    }
}

// ── Elementwise ─────────────────────────────────────────────────────────

/// Reference elementwise primitive over the whole tensor.
pub fn eltwise_forward(desc: &EltwiseDesc, src: &[u8], weights: &[u8], dst: &mut [u8]) {
    for i in 0..desc.elems() {
        let x = read_value(src, desc.src_dt, i);
        let y = match desc.alg {
            EltwiseAlg::Prelu(mode) => {
                let wi = match mode {
                    PreluMode::PerTensor => 0,
                    PreluMode::PerChannel => i % desc.channels,
                    PreluMode::Full => i,
                };
                let neg = x * read_f32(weights, wi);
                if x > 0.0 {
                    x
                } else {
                    neg
                }
            }
            EltwiseAlg::Activation(act) => act.apply(x),
        };
        store_value(dst, desc.dst_dt, i, y);
    }
}
