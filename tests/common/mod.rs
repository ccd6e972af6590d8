//! Shared helpers for kernel integration tests.

#![allow(dead_code)]

use conv_jit_kernels::compiler::{ConvKernel, ConvShape, ConvTensors};
use conv_jit_kernels::reference;
use conv_jit_kernels::DataType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Guard band around output buffers.
pub const GUARD: usize = 64;
pub const FILL: u8 = 0xA5;

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_tensor(rng: &mut StdRng, dt: DataType, n: usize) -> Vec<u8> {
    match dt {
        DataType::F32 => (0..n).flat_map(|_| rng.gen_range(-2.0f32..2.0).to_ne_bytes()).collect(),
        DataType::S32 => (0..n).flat_map(|_| rng.gen_range(-1000i32..1000).to_ne_bytes()).collect(),
        DataType::S8 => (0..n).map(|_| rng.gen::<i8>() as u8).collect(),
        DataType::U8 => (0..n).map(|_| rng.gen::<u8>()).collect(),
    }
}

fn f32_bytes(v: impl Iterator<Item = f32>) -> Vec<u8> {
    v.flat_map(f32::to_ne_bytes).collect()
}

/// Random operands for every tensor a convolution may read.
pub struct ConvData {
    pub src: Vec<u8>,
    pub weights: Vec<u8>,
    pub bias: Vec<u8>,
    pub scales: Vec<u8>,
    pub compensation: Vec<u8>,
    pub residual: Vec<u8>,
}

impl ConvData {
    pub fn random(s: &ConvShape, seed: u64) -> Self {
        let mut r = rng(seed);
        let src = random_tensor(&mut r, s.src_dt, s.src_elems());
        let weights = random_tensor(&mut r, s.wei_dt, s.wei_elems());
        let bias = f32_bytes((0..s.oc).map(|_| r.gen_range(-20.0f32..20.0)));
        let scales = f32_bytes((0..s.oc).map(|_| r.gen_range(0.001f32..0.05)));
        let compensation: Vec<u8> = (0..s.oc).flat_map(|_| r.gen_range(-5000i32..5000).to_ne_bytes()).collect();
        let residual = random_tensor(&mut r, s.dst_dt, s.dst_elems());
        ConvData { src, weights, bias, scales, compensation, residual }
    }

    pub fn tensors(&self) -> ConvTensors<'_> {
        ConvTensors::new(&self.src, &self.weights)
            .bias(&self.bias)
            .scales(&self.scales)
            .compensation(&self.compensation)
            .residual(&self.residual)
    }
}

pub fn dst_bytes(s: &ConvShape) -> usize {
    s.dst_elems() * s.dst_dt.size_bytes()
}

/// Run `k` into a dst buffer surrounded by guard bands and check the bands.
pub fn forward_guarded(k: &ConvKernel, t: &ConvTensors<'_>) -> Vec<u8> {
    let n = dst_bytes(&k.config().shape);
    let mut buf = vec![FILL; GUARD + n + GUARD];
    k.forward(t, &mut buf[GUARD..GUARD + n]).unwrap();
    assert!(buf[..GUARD].iter().all(|&b| b == FILL), "write before dst");
    assert!(buf[GUARD + n..].iter().all(|&b| b == FILL), "write past dst");
    buf[GUARD..GUARD + n].to_vec()
}

pub fn reference_output(k: &ConvKernel, t: &ConvTensors<'_>) -> Vec<u8> {
    let mut out = vec![0u8; dst_bytes(&k.config().shape)];
    reference::conv_forward(k.config(), t, &mut out);
    out
}

pub fn as_f32(bytes: &[u8]) -> Vec<f32> {
    conv_jit_kernels::types::from_bytes(bytes)
}
