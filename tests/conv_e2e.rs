//! End-to-end convolution tests.
//!
//! Every generated routine is compared byte for byte against the scalar
//! reference; outputs land between guard bands that must stay untouched.

mod common;

use common::{as_f32, forward_guarded, reference_output, ConvData};
use conv_jit_kernels::compiler::{
    AccInit, Activation, BoundsMode, ConvAttr, ConvShape, ConvTensors, KernelCompiler, PostOp, ScaleMode, TailMode,
};
use conv_jit_kernels::types::as_bytes;
use conv_jit_kernels::{DataType, IsaLevel, TargetDesc};

const ISAS: [IsaLevel; 4] = [IsaLevel::Sse41, IsaLevel::Avx2, IsaLevel::Avx512, IsaLevel::Neon];

fn check_against_reference(isa: IsaLevel, shape: &ConvShape, attr: &ConvAttr, seed: u64) {
    let k = KernelCompiler::for_isa(isa)
        .build_conv(shape, attr)
        .unwrap_or_else(|e| panic!("{isa:?} {shape:?}: {e}"));
    let data = ConvData::random(shape, seed);
    let got = forward_guarded(&k, &data.tensors());
    let want = reference_output(&k, &data.tensors());
    assert_eq!(got, want, "{isa:?} {shape:?} {attr:?}");
}

/// Taps of a 3×3 / pad 1 kernel inside a 5×8 image at (oh, ow).
fn taps_5x8(oh: usize, ow: usize) -> usize {
    let rows = if oh == 0 || oh == 4 { 2 } else { 3 };
    let cols = if ow == 0 || ow == 7 { 2 } else { 3 };
    rows * cols
}

// ── End-to-end example ──────────────────────────────────────────────────

#[test]
fn test_e2e_int8_19_channels_bias_clip() {
    let shape = ConvShape::new(19, 19, (5, 8), (3, 3)).pad(1).types(DataType::U8, DataType::S8, DataType::U8);
    let attr = ConvAttr::new()
        .post_op(PostOp::Bias)
        .post_op(PostOp::Activation(Activation::Clip { lo: 0.0, hi: 200.0 }));
    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
    let cfg = k.config();
    assert_eq!(cfg.nb_oc, 3);
    assert_eq!(cfg.oc_tail, TailMode::Masked { remainder: 3 });
    assert_eq!((cfg.nb_ic, cfg.ic_tail), (2, 3));

    let slope = |oc: usize| (oc % 3) as i32 - 1;
    let src = vec![1u8; shape.src_elems()];
    let wei: Vec<i8> = (0..shape.wei_elems()).map(|i| slope(i % 19) as i8).collect();
    let bias: Vec<f32> = (0..19).map(|oc| 0.5 + oc as f32).collect();
    let mut dst = vec![0u8; shape.dst_elems()];
    k.forward(&ConvTensors::new(&src, as_bytes(&wei)).bias(as_bytes(&bias)), &mut dst).unwrap();

    for oh in 0..5 {
        for ow in 0..8 {
            for oc in 0..19 {
                let acc = (taps_5x8(oh, ow) * 19) as i32 * slope(oc);
                let want = (acc as f32 + bias[oc]).max(0.0).min(200.0).round_ties_even() as u8;
                assert_eq!(dst[(oh * 8 + ow) * 19 + oc], want, "oh={oh} ow={ow} oc={oc}");
            }
        }
    }
    // Corner of channel 2: 76 + 2.5 rounds half to even.
    assert_eq!(dst[2], 78);
}

#[test]
fn test_e2e_f32_19_channels_bias_clip() {
    let shape = ConvShape::new(19, 19, (5, 8), (3, 3)).pad(1);
    let attr = ConvAttr::new()
        .post_op(PostOp::Bias)
        .post_op(PostOp::Activation(Activation::Clip { lo: -100.0, hi: 30.0 }));
    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
    assert_eq!(k.config().init, AccInit::Bias);

    let slope = |oc: usize| ((oc % 3) as f32 - 1.0) * 0.25;
    let src = vec![1.0f32; shape.src_elems()];
    let wei: Vec<f32> = (0..shape.wei_elems()).map(|i| slope(i % 19)).collect();
    let bias: Vec<f32> = (0..19).map(|oc| 0.5 + oc as f32).collect();
    let t = ConvTensors::new(as_bytes(&src), as_bytes(&wei)).bias(as_bytes(&bias));
    let got = as_f32(&forward_guarded(&k, &t));

    for oh in 0..5 {
        for ow in 0..8 {
            for oc in 0..19 {
                let want = ((taps_5x8(oh, ow) * 19) as f32 * slope(oc) + bias[oc]).clamp(-100.0, 30.0);
                let v = got[(oh * 8 + ow) * 19 + oc];
                assert!((v - want).abs() <= 1e-4, "oh={oh} ow={ow} oc={oc}: {v} vs {want}");
            }
        }
    }
    assert_eq!(as_bytes(&got), reference_output(&k, &t).as_slice());
}

// ── Tails and boundary safety ───────────────────────────────────────────

#[test]
fn test_channel_tails_match_reference() {
    for isa in ISAS {
        for oc in [1, 3, 9, 17, 19, 33] {
            let f32_shape = ConvShape::new(5, oc, (4, 6), (3, 3)).pad(1);
            check_against_reference(isa, &f32_shape, &ConvAttr::new(), oc as u64);
            let int_shape = f32_shape.types(DataType::U8, DataType::S8, DataType::S8);
            let attr = ConvAttr::new().post_op(PostOp::Scale(ScaleMode::PerChannel));
            check_against_reference(isa, &int_shape, &attr, 100 + oc as u64);
        }
    }
}

#[test]
fn test_source_reads_stay_in_bounds() {
    // NaN guards around the inputs poison any output that reads past them.
    let shape = ConvShape::new(11, 13, (4, 5), (3, 3)).pad(1);
    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &ConvAttr::new()).unwrap();
    let data = ConvData::random(&shape, 7);
    let guard = vec![f32::NAN; 32];
    let wrap = |inner: &[u8]| -> Vec<u8> {
        let mut v = as_bytes(&guard).to_vec();
        v.extend_from_slice(inner);
        v.extend_from_slice(as_bytes(&guard));
        v
    };
    let (src, wei) = (wrap(&data.src), wrap(&data.weights));
    let g = guard.len() * 4;
    let t = ConvTensors::new(&src[g..g + data.src.len()], &wei[g..g + data.weights.len()]);
    let got = forward_guarded(&k, &t);
    assert!(as_f32(&got).iter().all(|v| !v.is_nan()));
    assert_eq!(got, reference_output(&k, &t));
}

#[test]
fn test_rows_without_input_keep_initial_value() {
    // Top padding wider than the kernel: the first three output rows see no input.
    let shape = ConvShape::new(8, 10, (2, 3), (1, 1)).padding(3, 0, 0, 0);
    let attr = ConvAttr::new().post_op(PostOp::Bias);
    let k = KernelCompiler::for_isa(IsaLevel::Sse41).build_conv(&shape, &attr).unwrap();
    let data = ConvData::random(&shape, 3);
    let out = as_f32(&forward_guarded(&k, &data.tensors()));
    let bias = as_f32(&data.bias);
    for oh in 0..3 {
        for ow in 0..3 {
            assert_eq!(&out[(oh * 3 + ow) * 10..][..10], &bias[..]);
        }
    }
    assert_eq!(as_bytes(&out), reference_output(&k, &data.tensors()).as_slice());
}

// ── Boundary elimination ────────────────────────────────────────────────

fn boundary_shapes() -> Vec<ConvShape> {
    vec![
        ConvShape::new(6, 10, (7, 9), (3, 3)).pad(1),
        ConvShape::new(4, 8, (6, 11), (3, 5)).stride(2, 2).pad(2),
        ConvShape::new(9, 12, (9, 9), (3, 3)).dilation(2, 2).pad(2),
        ConvShape::new(3, 5, (5, 13), (2, 4)).stride(3, 3).dilation(2, 2).padding(0, 3, 1, 0),
        ConvShape::new(8, 8, (4, 4), (1, 1)).padding(3, 0, 0, 2),
        ConvShape::new(2, 4, (3, 2), (3, 3)).pad(2),
    ]
}

#[test]
fn test_narrowed_matches_naive() {
    for (i, shape) in boundary_shapes().into_iter().enumerate() {
        for shape in [shape, shape.types(DataType::S8, DataType::S8, DataType::S32)] {
            let data = ConvData::random(&shape, i as u64);
            let outs: Vec<Vec<u8>> = [BoundsMode::Narrowed, BoundsMode::Naive]
                .into_iter()
                .map(|mode| {
                    let attr = ConvAttr::new().bounds(mode);
                    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
                    forward_guarded(&k, &data.tensors())
                })
                .collect();
            assert_eq!(outs[0], outs[1], "{shape:?}");
        }
    }
}

#[test]
fn test_naive_lowering_matches_reference() {
    for (i, shape) in boundary_shapes().into_iter().enumerate() {
        let attr = ConvAttr::new().bounds(BoundsMode::Naive);
        check_against_reference(IsaLevel::Sse41, &shape, &attr, 50 + i as u64);
    }
}

#[test]
fn test_depthwise_strided_dilated() {
    let base = ConvShape::depthwise(19, (6, 7), (3, 3)).stride(2, 1).dilation(1, 2).pad(2);
    for isa in ISAS {
        check_against_reference(isa, &base, &ConvAttr::new().post_op(PostOp::Bias), 9);
        let int = base.types(DataType::U8, DataType::S8, DataType::U8);
        let attr = ConvAttr::new()
            .post_op(PostOp::Compensation)
            .post_op(PostOp::Scale(ScaleMode::PerTensor(0.01)))
            .post_op(PostOp::Activation(Activation::Relu { alpha: 0.0 }));
        check_against_reference(isa, &int, &attr, 10);
        check_against_reference(isa, &int, &attr.clone().bounds(BoundsMode::Naive), 10);
    }
}

// ── Post-op composition ─────────────────────────────────────────────────

#[test]
fn test_post_op_chain_matches_independent_functions() {
    // 1×1 kernel, one channel, weight 1: each accumulator equals its input.
    let shape = ConvShape::new(1, 1, (1, 5), (1, 1));
    let (alpha, bias, sum_scale) = (0.1f32, 0.5f32, 0.5f32);
    let attr = ConvAttr::new()
        .post_op(PostOp::Scale(ScaleMode::PerTensor(2.0)))
        .post_op(PostOp::Bias)
        .post_op(PostOp::Activation(Activation::Relu { alpha }))
        .post_op(PostOp::Sum { scale: sum_scale });
    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
    assert_eq!(k.config().init, AccInit::Zero);

    let acc = [0.0f32, -3.0, 5.0, 1e30, -0.25];
    let residual = [1.0f32, -1.0, 0.0, -1e30, 7.0];
    let (wei, bias_buf) = ([1.0f32], [bias]);
    let t = ConvTensors::new(as_bytes(&acc), as_bytes(&wei))
        .bias(as_bytes(&bias_buf))
        .residual(as_bytes(&residual));
    let got = as_f32(&forward_guarded(&k, &t));

    let scale = |x: f32| x * 2.0;
    let add_bias = |x: f32| x + bias;
    let relu = |x: f32| if x > 0.0 { x } else { x * alpha };
    let sum = |x: f32, r: f32| x + r * sum_scale;
    for i in 0..acc.len() {
        let want = sum(relu(add_bias(scale(acc[i]))), residual[i]);
        assert_eq!(got[i].to_bits(), want.to_bits(), "i={i}");
    }
}

#[test]
fn test_post_op_chain_saturates_integer_dst() {
    let shape = ConvShape::new(1, 1, (1, 6), (1, 1)).types(DataType::U8, DataType::S8, DataType::U8);
    let attr = ConvAttr::new()
        .post_op(PostOp::Scale(ScaleMode::PerTensor(0.5)))
        .post_op(PostOp::Bias)
        .post_op(PostOp::Activation(Activation::Relu { alpha: 0.0 }))
        .post_op(PostOp::Sum { scale: 1.0 });
    let k = KernelCompiler::for_isa(IsaLevel::Sse41).build_conv(&shape, &attr).unwrap();

    let src = [0u8, 3, 200, 255, 1, 5];
    let residual = [0u8, 1, 255, 255, 0, 0];
    let (wei, bias) = ([1i8], [-1.0f32]);
    let t = ConvTensors::new(&src, as_bytes(&wei)).bias(as_bytes(&bias)).residual(&residual);
    let got = forward_guarded(&k, &t);
    // 0 → -1 → 0; 3 → 0.5 → 1.5 → 2; 200 → 99 → 354 → 255; 1 → -0.5 → 0; 5 → 1.5 → 2
    assert_eq!(got, vec![0, 2, 255, 255, 0, 2]);
}

#[test]
fn test_post_op_combinations_match_reference() {
    let int = ConvShape::new(13, 19, (4, 9), (3, 3)).pad(1).types(DataType::U8, DataType::S8, DataType::U8);
    let chains = vec![
        ConvAttr::new()
            .post_op(PostOp::Compensation)
            .post_op(PostOp::Scale(ScaleMode::PerChannel))
            .post_op(PostOp::Bias)
            .post_op(PostOp::Activation(Activation::Relu { alpha: 0.2 }))
            .post_op(PostOp::Sum { scale: 0.5 }),
        ConvAttr::new()
            .post_op(PostOp::Bias)
            .post_op(PostOp::Compensation)
            .post_op(PostOp::Scale(ScaleMode::PerTensor(0.003)))
            .post_op(PostOp::Activation(Activation::Linear { alpha: -1.5, beta: 3.0 })),
        ConvAttr::new().post_op(PostOp::Sum { scale: 1.0 }),
    ];
    for (i, attr) in chains.iter().enumerate() {
        for dst in [DataType::U8, DataType::S8, DataType::S32, DataType::F32] {
            let shape = int.types(DataType::U8, DataType::S8, dst);
            check_against_reference(IsaLevel::Avx2, &shape, attr, i as u64);
        }
    }

    let f32_shape = ConvShape::new(13, 19, (4, 9), (3, 3)).pad(1);
    let attr = ConvAttr::new()
        .post_op(PostOp::Bias)
        .post_op(PostOp::Scale(ScaleMode::PerChannel))
        .post_op(PostOp::Activation(Activation::Clip { lo: -0.5, hi: 0.5 }))
        .post_op(PostOp::Sum { scale: -2.0 });
    check_against_reference(IsaLevel::Avx512, &f32_shape, &attr, 77);
}

// ── Build properties ────────────────────────────────────────────────────

#[test]
fn test_build_is_deterministic() {
    let shape = ConvShape::new(19, 19, (5, 8), (3, 3)).pad(1).types(DataType::U8, DataType::S8, DataType::U8);
    let attr = ConvAttr::new().post_op(PostOp::Bias);
    let c = KernelCompiler::for_isa(IsaLevel::Avx2);
    let (a, b) = (c.build_conv(&shape, &attr).unwrap(), c.build_conv(&shape, &attr).unwrap());
    assert_eq!(a.routine().code(), b.routine().code());
    assert_eq!(a.routine().config_hash(), b.routine().config_hash());

    let other = KernelCompiler::for_isa(IsaLevel::Avx512).build_conv(&shape, &attr).unwrap();
    assert_ne!(a.routine().config_hash(), other.routine().config_hash());
}

#[test]
fn test_pressure_retry_output_is_correct() {
    let shape = ConvShape::new(7, 19, (3, 8), (3, 3)).pad(1);
    let attr = ConvAttr::new().blocking(8, 3).post_op(PostOp::Sum { scale: 1.0 });
    let k = KernelCompiler::for_isa(IsaLevel::Avx2).build_conv(&shape, &attr).unwrap();
    assert!(k.config().ur_w * k.config().nb_oc_blocking < 24);
    let data = ConvData::random(&shape, 5);
    assert_eq!(forward_guarded(&k, &data.tensors()), reference_output(&k, &data.tensors()));
}

#[test]
fn test_small_register_file_target() {
    let t = TargetDesc { num_vregs: 8, ..TargetDesc::sse41() };
    let shape = ConvShape::new(6, 6, (4, 7), (3, 3)).pad(1);
    let attr = ConvAttr::new().post_op(PostOp::Activation(Activation::Relu { alpha: 0.5 }));
    let k = KernelCompiler::new(t).build_conv(&shape, &attr).unwrap();
    // 5 accumulators + weight + input + mask fill the 8-register file.
    assert_eq!((k.config().ur_w, k.config().nb_oc_blocking), (5, 1));
    let data = ConvData::random(&shape, 6);
    assert_eq!(forward_guarded(&k, &data.tensors()), reference_output(&k, &data.tensors()));
}
