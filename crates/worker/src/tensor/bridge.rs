//! Tensor bridge between the interpreter and the inference engine
//!
//! Interpreter arrays cross into the host as an [`ArrayPayload`] (type name,
//! shape and contiguous bytes), are checked into a [`TensorDescriptor`] and
//! then built into the engine's native tensor type. Outputs travel the same
//! way back. Data is copied at each hop; shape and dtype never change.

use super::{DType, TensorDescriptor};
use crate::engine::{EngineTensor, NamedTensors};
use crate::interpreter::Interpreter;
use thiserror::Error;

/// Tensor conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Element type with no counterpart on the other side
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// Typed access with the wrong element type
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Buffer length disagrees with dtype and shape
    #[error("buffer of {actual} bytes does not match {dtype} tensor of shape {shape:?} ({expected} bytes)")]
    BufferSize {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// Shape whose byte size does not fit in memory
    #[error("shape {0:?} overflows")]
    ShapeOverflow(Vec<usize>),

    /// Native tensor could not be built or read
    #[error("engine tensor: {0}")]
    Engine(String),

    /// Interpreter array could not be built or read
    #[error("interpreter array: {0}")]
    Interpreter(String),
}

/// Host-side copy of an interpreter array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayPayload {
    /// Interpreter type name (`float32`, `int64`, ...)
    pub dtype: String,

    pub shape: Vec<usize>,

    /// Row-major element bytes
    pub data: Vec<u8>,
}

impl ArrayPayload {
    /// Payload for a descriptor
    pub fn from_descriptor(tensor: &TensorDescriptor) -> Self {
        Self {
            dtype: tensor.dtype().as_str().to_string(),
            shape: tensor.shape().to_vec(),
            data: tensor.as_bytes().to_vec(),
        }
    }

    /// Check the payload and turn it into a descriptor
    pub fn into_descriptor(self) -> Result<TensorDescriptor, BridgeError> {
        let dtype = DType::from_name(&self.dtype)
            .ok_or_else(|| BridgeError::UnsupportedDtype(self.dtype.clone()))?;
        TensorDescriptor::new(dtype, self.shape, self.data)
    }
}

/// Convert preprocess output into an engine feed, keeping names and order
pub fn to_engine_feed<I, T>(
    interpreter: &mut I,
    arrays: Vec<(String, I::Array)>,
) -> Result<NamedTensors<T>, BridgeError>
where
    I: Interpreter,
    T: EngineTensor,
{
    arrays
        .into_iter()
        .map(|(name, array)| {
            let payload = interpreter
                .export_array(&array)
                .map_err(|e| BridgeError::Interpreter(format!("{}: {}", name, e.summary())))?;
            let tensor = T::from_descriptor(payload.into_descriptor()?)?;
            Ok((name, tensor))
        })
        .collect()
}

/// Convert engine outputs into interpreter arrays, keeping names and order
pub fn to_interpreter_arrays<I, T>(
    interpreter: &mut I,
    outputs: &NamedTensors<T>,
) -> Result<Vec<(String, I::Array)>, BridgeError>
where
    I: Interpreter,
    T: EngineTensor,
{
    outputs
        .iter()
        .map(|(name, tensor)| {
            let payload = ArrayPayload::from_descriptor(&tensor.to_descriptor()?);
            let array = interpreter
                .import_array(payload)
                .map_err(|e| BridgeError::Interpreter(format!("{}: {}", name, e.summary())))?;
            Ok((name.clone(), array))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedInterpreter;

    #[test]
    fn test_payload_round_trip_all_dtypes() {
        for dtype in DType::ALL {
            let shape = vec![2, 3];
            let data = vec![1u8; 6 * dtype.size()];
            let payload = ArrayPayload {
                dtype: dtype.as_str().to_string(),
                shape: shape.clone(),
                data: data.clone(),
            };

            let tensor = payload.clone().into_descriptor().unwrap();
            assert_eq!(tensor.dtype(), dtype);
            assert_eq!(tensor.shape(), shape.as_slice());
            assert_eq!(ArrayPayload::from_descriptor(&tensor), payload);
        }
    }

    #[test]
    fn test_unsupported_dtype() {
        let payload = ArrayPayload {
            dtype: "object".to_string(),
            shape: vec![1],
            data: vec![0; 8],
        };

        assert_eq!(
            payload.into_descriptor(),
            Err(BridgeError::UnsupportedDtype("object".to_string()))
        );
    }

    #[test]
    fn test_feed_and_back_preserve_order_and_data() {
        let mut interpreter = ScriptedInterpreter::new();
        let image = TensorDescriptor::from_elements(vec![1, 0, 3], &[] as &[f32]).unwrap();
        let mask = TensorDescriptor::from_elements(vec![2], &[7i64, -1]).unwrap();
        let arrays = vec![
            ("image".to_string(), ArrayPayload::from_descriptor(&image)),
            ("mask".to_string(), ArrayPayload::from_descriptor(&mask)),
        ];

        let feed: NamedTensors<TensorDescriptor> = to_engine_feed(&mut interpreter, arrays).unwrap();
        assert_eq!(feed[0], ("image".to_string(), image.clone()));
        assert_eq!(feed[1], ("mask".to_string(), mask.clone()));

        let back = to_interpreter_arrays(&mut interpreter, &feed).unwrap();
        assert_eq!(back[0].1, ArrayPayload::from_descriptor(&image));
        assert_eq!(back[1].1.shape, vec![2]);
    }

    #[test]
    fn test_feed_rejects_bad_buffer() {
        let mut interpreter = ScriptedInterpreter::new();
        let arrays = vec![(
            "x".to_string(),
            ArrayPayload {
                dtype: "float32".to_string(),
                shape: vec![4],
                data: vec![0; 3],
            },
        )];

        let result: Result<NamedTensors<TensorDescriptor>, _> = to_engine_feed(&mut interpreter, arrays);
        assert!(matches!(result, Err(BridgeError::BufferSize { .. })));
    }
}
