//! Tensor data structures
//!
//! A `TensorDescriptor` is the owned, engine-neutral form of a tensor: element
//! type, shape and the contiguous little-endian element bytes. It sits between
//! interpreter arrays and engine tensors; see [`bridge`].

pub mod bridge;
pub mod dtype;

pub use bridge::{ArrayPayload, BridgeError};
pub use dtype::{DType, Element};

use std::fmt;

/// Tensor shape
pub type Shape = Vec<usize>;

/// Owned tensor: dtype, shape and row-major element bytes
#[derive(Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    dtype: DType,
    shape: Shape,
    buffer: Vec<u8>,
}

impl TensorDescriptor {
    /// Create a descriptor, checking the buffer against the shape.
    ///
    /// Zero-length dimensions are valid and require an empty buffer.
    pub fn new(dtype: DType, shape: Shape, buffer: Vec<u8>) -> Result<Self, BridgeError> {
        let expected = byte_len(dtype, &shape)?;
        if buffer.len() != expected {
            return Err(BridgeError::BufferSize {
                dtype,
                shape,
                expected,
                actual: buffer.len(),
            });
        }

        Ok(Self { dtype, shape, buffer })
    }

    /// Create a descriptor from typed elements
    pub fn from_elements<T: Element>(shape: Shape, elements: &[T]) -> Result<Self, BridgeError> {
        Self::new(T::DTYPE, shape, bytemuck::cast_slice(elements).to_vec())
    }

    /// Create a bool descriptor (one byte per element)
    pub fn from_bools(shape: Shape, elements: &[bool]) -> Result<Self, BridgeError> {
        let buffer = elements.iter().map(|&b| u8::from(b)).collect();
        Self::new(DType::Bool, shape, buffer)
    }

    /// Element type
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw element bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    pub fn num_elements(&self) -> usize {
        self.buffer.len() / self.dtype.size()
    }

    /// Check if the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Copy the elements out as `T`; the dtype must match
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BridgeError> {
        if T::DTYPE != self.dtype {
            return Err(BridgeError::DTypeMismatch {
                expected: T::DTYPE,
                actual: self.dtype,
            });
        }
        // The buffer carries no alignment guarantee.
        Ok(bytemuck::pod_collect_to_vec(&self.buffer))
    }

    /// Copy the elements out as bools; the dtype must be `bool`
    pub fn to_bools(&self) -> Result<Vec<bool>, BridgeError> {
        if self.dtype != DType::Bool {
            return Err(BridgeError::DTypeMismatch {
                expected: DType::Bool,
                actual: self.dtype,
            });
        }
        Ok(self.buffer.iter().map(|&b| b != 0).collect())
    }

    /// Split into parts
    pub fn into_parts(self) -> (DType, Shape, Vec<u8>) {
        (self.dtype, self.shape, self.buffer)
    }
}

impl fmt::Debug for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDescriptor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("bytes", &self.buffer.len())
            .finish()
    }
}

/// Expected buffer length for a dtype and shape
pub fn byte_len(dtype: DType, shape: &[usize]) -> Result<usize, BridgeError> {
    shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| BridgeError::ShapeOverflow(shape.to_vec()))
}
