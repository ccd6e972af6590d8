//! ConvShape — immutable description of one convolution instance.
//!
//! Layouts are channels-last: src `N×IH×IW×IC`, weights `KH×KW×IC×OC`
//! (depthwise: `KH×KW×C`), dst `N×OH×OW×OC`. A dilation of 1 is dense.

use crate::types::DataType;

/// Problem shape of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvShape {
    pub batch: usize,
    pub ic: usize,
    pub oc: usize,
    pub ih: usize,
    pub iw: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dil_h: usize,
    pub dil_w: usize,
    pub pad_t: usize,
    pub pad_l: usize,
    pub pad_b: usize,
    pub pad_r: usize,
    /// 1 for a dense convolution, `ic` (== `oc`) for depthwise.
    pub groups: usize,
    pub src_dt: DataType,
    pub wei_dt: DataType,
    pub dst_dt: DataType,
}

/// Output extent along one spatial axis, `None` when the dilated kernel does
/// not fit the padded input.
fn output_extent(input: usize, k: usize, stride: usize, dil: usize, lo: usize, hi: usize) -> Option<usize> {
    if k == 0 || stride == 0 || dil == 0 {
        return None;
    }
    let span = (k - 1) * dil + 1;
    let padded = input + lo + hi;
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

impl ConvShape {
    /// Dense f32 convolution, batch 1, stride 1, no dilation or padding.
    pub fn new(ic: usize, oc: usize, (ih, iw): (usize, usize), (kh, kw): (usize, usize)) -> Self {
        ConvShape {
            batch: 1,
            ic,
            oc,
            ih,
            iw,
            kh,
            kw,
            stride_h: 1,
            stride_w: 1,
            dil_h: 1,
            dil_w: 1,
            pad_t: 0,
            pad_l: 0,
            pad_b: 0,
            pad_r: 0,
            groups: 1,
            src_dt: DataType::F32,
            wei_dt: DataType::F32,
            dst_dt: DataType::F32,
        }
    }

    /// Depthwise convolution over `channels` channels.
    pub fn depthwise(channels: usize, spatial: (usize, usize), kernel: (usize, usize)) -> Self {
        ConvShape { groups: channels, ..Self::new(channels, channels, spatial, kernel) }
    }

    pub fn batch(mut self, n: usize) -> Self {
        self.batch = n;
        self
    }

    pub fn stride(mut self, h: usize, w: usize) -> Self {
        self.stride_h = h;
        self.stride_w = w;
        self
    }

    pub fn dilation(mut self, h: usize, w: usize) -> Self {
        self.dil_h = h;
        self.dil_w = w;
        self
    }

    /// Padding as (top, left, bottom, right).
    pub fn padding(mut self, t: usize, l: usize, b: usize, r: usize) -> Self {
        self.pad_t = t;
        self.pad_l = l;
        self.pad_b = b;
        self.pad_r = r;
        self
    }

    /// Symmetric padding on all sides.
    pub fn pad(self, p: usize) -> Self {
        self.padding(p, p, p, p)
    }

    pub fn types(mut self, src: DataType, wei: DataType, dst: DataType) -> Self {
        self.src_dt = src;
        self.wei_dt = wei;
        self.dst_dt = dst;
        self
    }

    #[inline]
    pub fn is_depthwise(&self) -> bool {
        self.groups > 1
    }

    pub fn checked_oh(&self) -> Option<usize> {
        output_extent(self.ih, self.kh, self.stride_h, self.dil_h, self.pad_t, self.pad_b)
    }

    pub fn checked_ow(&self) -> Option<usize> {
        output_extent(self.iw, self.kw, self.stride_w, self.dil_w, self.pad_l, self.pad_r)
    }

    /// Output height (0 if the kernel does not fit).
    pub fn oh(&self) -> usize {
        self.checked_oh().unwrap_or(0)
    }

    /// Output width (0 if the kernel does not fit).
    pub fn ow(&self) -> usize {
        self.checked_ow().unwrap_or(0)
    }

    pub fn src_elems(&self) -> usize {
        self.batch * self.ih * self.iw * self.ic
    }

    pub fn wei_elems(&self) -> usize {
        if self.is_depthwise() {
            self.kh * self.kw * self.oc
        } else {
            self.kh * self.kw * self.ic * self.oc
        }
    }

    pub fn dst_elems(&self) -> usize {
        self.batch * self.oh() * self.ow() * self.oc
    }
}
