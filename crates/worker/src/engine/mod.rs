//! Inference engine abstraction
//!
//! An `InferenceSession` is built once per process from serialized model bytes
//! and then runs a feed of named tensors into named outputs. The ONNX Runtime
//! implementation lives in [`onnx`] behind the `onnx` feature.

#[cfg(feature = "onnx")]
pub mod onnx;

use crate::tensor::{BridgeError, TensorDescriptor};
use sliceloop_common::ProviderPreference;
use sliceloop_common::config::WorkerConfig;
use thiserror::Error;

/// Named tensors in feed or output order
pub type NamedTensors<T> = Vec<(String, T)>;

/// Inference engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Model bytes rejected or session construction failed
    #[error("failed to create inference session: {0}")]
    SessionCreation(String),

    /// Session run failed (bad feed, shape mismatch, provider failure)
    #[error("inference failed: {0}")]
    Run(String),

    /// A declared output was not produced
    #[error("output `{0}` missing from inference results")]
    MissingOutput(String),

    /// Tensor conversion failed inside the engine
    #[error(transparent)]
    Tensor(#[from] BridgeError),
}

/// Native tensor type of an engine
pub trait EngineTensor: Sized {
    /// Build a native tensor
    fn from_descriptor(tensor: TensorDescriptor) -> Result<Self, BridgeError>;

    /// Read a native tensor back
    fn to_descriptor(&self) -> Result<TensorDescriptor, BridgeError>;
}

/// Descriptors double as tensors for engines that work on host memory.
impl EngineTensor for TensorDescriptor {
    fn from_descriptor(tensor: TensorDescriptor) -> Result<Self, BridgeError> {
        Ok(tensor)
    }

    fn to_descriptor(&self) -> Result<TensorDescriptor, BridgeError> {
        Ok(self.clone())
    }
}

/// Loaded model ready to run
pub trait InferenceSession: Send {
    type Tensor: EngineTensor;

    /// Input names in model order
    fn input_names(&self) -> &[String];

    /// Output names in model order
    fn output_names(&self) -> &[String];

    /// Provider the session was built with
    fn provider(&self) -> ProviderPreference;

    /// Run the model; outputs come back in `output_names` order
    fn run(&mut self, feed: NamedTensors<Self::Tensor>) -> Result<NamedTensors<Self::Tensor>, EngineError>;
}

/// Options for building a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Execution provider preference
    pub provider: ProviderPreference,

    /// Enable all graph optimizations
    pub graph_optimization: bool,

    /// Intra-op threads (0 = engine default)
    pub intra_threads: usize,
}

impl SessionOptions {
    /// Options from worker configuration; an accelerated job overrides the
    /// configured default provider
    pub fn from_config(config: &WorkerConfig, accelerated: bool) -> Self {
        let provider = if accelerated {
            ProviderPreference::Accelerated
        } else {
            config.default_provider
        };

        Self {
            provider,
            graph_optimization: config.graph_optimization,
            intra_threads: config.intra_threads,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), false)
    }
}
