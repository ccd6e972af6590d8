//! Core types shared by the resolver, planner, code generator and executor.
//!
//! - `DataType`: element types a routine can load, accumulate and store.
//! - `Element`: typed view over raw byte buffers (used by callers and the
//!   scalar reference).
//! - `ConfigError` / `KernelError`: build-time and host-side failures. The
//!   generated routine itself never reports errors.

use thiserror::Error;

/// Element type of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Element size in bytes.
    #[inline]
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    /// Whether values of this type are integers (loaded into i32 lanes).
    #[inline]
    pub const fn is_integer(self) -> bool {
        !matches!(self, DataType::F32)
    }

    /// Saturation range used when converting an f32 value to this type.
    ///
    /// The S32 upper bound is the largest f32 strictly below 2^31, so the
    /// clamped value always converts without overflow.
    pub const fn saturation_bounds(self) -> Option<(f32, f32)> {
        match self {
            DataType::F32 => None,
            DataType::S32 => Some((-2147483648.0, 2147483520.0)),
            DataType::S8 => Some((-128.0, 127.0)),
            DataType::U8 => Some((0.0, 255.0)),
        }
    }

    /// Compact tag used by the instruction encoding.
    pub(crate) const fn tag(self) -> u8 {
        match self {
            DataType::F32 => 0,
            DataType::S32 => 1,
            DataType::S8 => 2,
            DataType::U8 => 3,
        }
    }

    pub(crate) const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DataType::F32),
            1 => Some(DataType::S32),
            2 => Some(DataType::S8),
            3 => Some(DataType::U8),
            _ => None,
        }
    }
}

/// A plain-old-data element type with a matching `DataType`.
pub trait Element: bytemuck::Pod {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::S32;
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::S8;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

/// View a typed slice as raw bytes.
#[inline]
pub fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    bytemuck::cast_slice(data)
}

/// Decode raw bytes into typed elements (the byte buffer need not be aligned).
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Register file that ran out of physical registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Vector,
    Scalar,
}

impl std::fmt::Display for RegClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegClass::Vector => write!(f, "vector"),
            RegClass::Scalar => write!(f, "scalar"),
        }
    }
}

/// Build-time configuration failure. Fatal for the primitive being built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// No valid blocking scheme exists for the shape/attribute combination.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// The fused post-op sequence cannot be satisfied in the given order.
    #[error("invalid post-op order: {0}")]
    InvalidPostOpOrder(String),

    /// The configuration needs more live registers than the target provides.
    #[error("{class} register pressure: need {needed}, have {available}")]
    RegisterPressure {
        class: RegClass,
        needed: usize,
        available: usize,
    },
}

/// Host-side failure around a built kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A buffer handed to a safe execution helper is smaller than the
    /// configuration requires.
    #[error("buffer `{name}` too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        name: &'static str,
        needed: usize,
        got: usize,
    },

    /// Encoded routine bytes are malformed.
    #[error("malformed routine code at byte {offset}: {reason}")]
    Decode { offset: usize, reason: String },
}

/// Result alias for kernel construction and host-side helpers.
pub type Result<T> = std::result::Result<T, KernelError>;
