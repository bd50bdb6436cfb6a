//! ONNX Runtime inference sessions

use super::{EngineError, EngineTensor, InferenceSession, NamedTensors, SessionOptions};
use crate::tensor::{BridgeError, DType, Element, TensorDescriptor};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::tensor::{PrimitiveTensorElementType, TensorElementType};
use ort::value::{DynValue, Tensor, ValueType};
use sliceloop_common::ProviderPreference;
use std::borrow::Cow;
use std::fmt::Debug;
use tracing::{debug, info};

/// ONNX Runtime session with its input and output names
pub struct OrtSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
    provider: ProviderPreference,
}

impl OrtSession {
    /// Build a session from serialized model bytes
    pub fn from_memory(model: &[u8], options: &SessionOptions) -> Result<Self, EngineError> {
        let level = if options.graph_optimization {
            GraphOptimizationLevel::Level3
        } else {
            GraphOptimizationLevel::Disable
        };

        let mut builder = Session::builder()
            .map_err(|e| EngineError::SessionCreation(e.to_string()))?
            .with_optimization_level(level)
            .map_err(|e| EngineError::SessionCreation(e.to_string()))?;

        if options.intra_threads > 0 {
            builder = builder
                .with_intra_threads(options.intra_threads)
                .map_err(|e| EngineError::SessionCreation(e.to_string()))?;
        }

        let session = builder
            .with_execution_providers(execution_providers(options.provider))
            .map_err(|e| EngineError::SessionCreation(e.to_string()))?
            .commit_from_memory(model)
            .map_err(|e| EngineError::SessionCreation(e.to_string()))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        info!(
            provider = ?options.provider,
            inputs = ?input_names,
            outputs = ?output_names,
            "ONNX session created ({} bytes)",
            model.len()
        );

        Ok(Self {
            session,
            input_names,
            output_names,
            provider: options.provider,
        })
    }
}

/// Providers in preference order; registration failures fall through to CPU
fn execution_providers(preference: ProviderPreference) -> Vec<ExecutionProviderDispatch> {
    match preference {
        ProviderPreference::Accelerated => vec![
            CUDAExecutionProvider::default().build(),
            CoreMLExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        ProviderPreference::Cpu => vec![CPUExecutionProvider::default().build()],
    }
}

impl InferenceSession for OrtSession {
    type Tensor = DynValue;

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn provider(&self) -> ProviderPreference {
        self.provider
    }

    fn run(&mut self, feed: NamedTensors<DynValue>) -> Result<NamedTensors<DynValue>, EngineError> {
        let inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = feed
            .into_iter()
            .map(|(name, value)| (Cow::Owned(name), SessionInputValue::from(value)))
            .collect();

        let mut outputs = self
            .session
            .run(SessionInputs::from(inputs))
            .map_err(|e| EngineError::Run(e.to_string()))?;

        let mut results = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs
                .remove(name.as_str())
                .ok_or_else(|| EngineError::MissingOutput(name.clone()))?;
            results.push((name.clone(), value));
        }

        debug!("Session produced {} outputs", results.len());
        Ok(results)
    }
}

impl EngineTensor for DynValue {
    fn from_descriptor(tensor: TensorDescriptor) -> Result<Self, BridgeError> {
        let shape: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();

        match tensor.dtype() {
            DType::Float32 => build::<f32>(shape, &tensor),
            DType::Float64 => build::<f64>(shape, &tensor),
            DType::Float16 => build::<half::f16>(shape, &tensor),
            DType::Int8 => build::<i8>(shape, &tensor),
            DType::Int16 => build::<i16>(shape, &tensor),
            DType::Int32 => build::<i32>(shape, &tensor),
            DType::Int64 => build::<i64>(shape, &tensor),
            DType::Uint8 => build::<u8>(shape, &tensor),
            DType::Uint16 => build::<u16>(shape, &tensor),
            DType::Uint32 => build::<u32>(shape, &tensor),
            DType::Uint64 => build::<u64>(shape, &tensor),
            DType::Bool => Tensor::from_array((shape, tensor.to_bools()?))
                .map(|t| t.into_dyn())
                .map_err(|e| BridgeError::Engine(e.to_string())),
        }
    }

    fn to_descriptor(&self) -> Result<TensorDescriptor, BridgeError> {
        let element = match self.dtype() {
            ValueType::Tensor { ty, .. } => *ty,
            other => return Err(BridgeError::UnsupportedDtype(format!("{:?}", other))),
        };

        match element {
            TensorElementType::Float32 => extract::<f32>(self),
            TensorElementType::Float64 => extract::<f64>(self),
            TensorElementType::Float16 => extract::<half::f16>(self),
            TensorElementType::Int8 => extract::<i8>(self),
            TensorElementType::Int16 => extract::<i16>(self),
            TensorElementType::Int32 => extract::<i32>(self),
            TensorElementType::Int64 => extract::<i64>(self),
            TensorElementType::Uint8 => extract::<u8>(self),
            TensorElementType::Uint16 => extract::<u16>(self),
            TensorElementType::Uint32 => extract::<u32>(self),
            TensorElementType::Uint64 => extract::<u64>(self),
            TensorElementType::Bool => {
                let (shape, data) = self
                    .try_extract_tensor::<bool>()
                    .map_err(|e| BridgeError::Engine(e.to_string()))?;
                TensorDescriptor::from_bools(to_shape(shape), data)
            }
            other => Err(BridgeError::UnsupportedDtype(format!("{:?}", other))),
        }
    }
}

fn build<T>(shape: Vec<i64>, tensor: &TensorDescriptor) -> Result<DynValue, BridgeError>
where
    T: Element + PrimitiveTensorElementType + Debug + Clone + 'static,
{
    let data = tensor.to_vec::<T>()?;
    Tensor::from_array((shape, data))
        .map(|t| t.into_dyn())
        .map_err(|e| BridgeError::Engine(e.to_string()))
}

fn extract<T>(value: &DynValue) -> Result<TensorDescriptor, BridgeError>
where
    T: Element + PrimitiveTensorElementType + Debug + Clone + 'static,
{
    let (shape, data) = value
        .try_extract_tensor::<T>()
        .map_err(|e| BridgeError::Engine(e.to_string()))?;
    TensorDescriptor::from_elements(to_shape(shape), data)
}

fn to_shape(dims: &[i64]) -> Vec<usize> {
    dims.iter().map(|&d| d.max(0) as usize).collect()
}
