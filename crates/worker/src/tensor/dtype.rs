//! Element types shared by the interpreter and the inference engine
//!
//! Both sides name their element types the same way (`float32`, `int64`,
//! `bool`, ...), so a single name table serves both directions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Float32
    Float32,
    /// Float64
    Float64,
    /// Float16 (IEEE half)
    Float16,
    /// Int8
    Int8,
    /// Int16
    Int16,
    /// Int32
    Int32,
    /// Int64
    Int64,
    /// UInt8
    Uint8,
    /// UInt16
    Uint16,
    /// UInt32
    Uint32,
    /// UInt64
    Uint64,
    /// Bool, one byte per element
    Bool,
}

impl DType {
    /// Every supported element type
    pub const ALL: [DType; 12] = [
        DType::Float32,
        DType::Float64,
        DType::Float16,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::Uint8,
        DType::Uint16,
        DType::Uint32,
        DType::Uint64,
        DType::Bool,
    ];

    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            DType::Float64 | DType::Int64 | DType::Uint64 => 8,
            DType::Float32 | DType::Int32 | DType::Uint32 => 4,
            DType::Float16 | DType::Int16 | DType::Uint16 => 2,
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
        }
    }

    /// Parse from the interpreter/engine type name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(DType::Float32),
            "float64" => Some(DType::Float64),
            "float16" => Some(DType::Float16),
            "int8" => Some(DType::Int8),
            "int16" => Some(DType::Int16),
            "int32" => Some(DType::Int32),
            "int64" => Some(DType::Int64),
            "uint8" => Some(DType::Uint8),
            "uint16" => Some(DType::Uint16),
            "uint32" => Some(DType::Uint32),
            "uint64" => Some(DType::Uint64),
            "bool" => Some(DType::Bool),
            _ => None,
        }
    }

    /// Convert to the interpreter/engine type name
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Float16 => "float16",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Uint64 => "uint64",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::from_name(s).ok_or_else(|| s.to_string())
    }
}

/// Rust element types with a fixed-size, any-bit-pattern representation
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element! {
    f32 => Float32,
    f64 => Float64,
    half::f16 => Float16,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
}
