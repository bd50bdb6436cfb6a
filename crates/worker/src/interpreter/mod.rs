//! Embedded interpreter for user pre/post-processing code
//!
//! User modules are plain source files executed by an interpreter started once
//! per process. The [`Interpreter`] trait is what the rest of the worker sees;
//! the CPython implementation lives in [`python`] behind the `python` feature.

#[cfg(feature = "python")]
pub mod python;

use crate::tensor::ArrayPayload;
use serde_json::Value;
use sliceloop_proto::last_meaningful_line;
use thiserror::Error;

/// Interpreter errors
#[derive(Error, Debug)]
pub enum InterpreterError {
    /// The interpreter itself could not be brought up
    #[error("interpreter failed to start: {0}")]
    Startup(String),

    /// A package could not be loaded
    #[error("failed to load package {package}: {message}")]
    Package { package: String, message: String },

    /// User code raised; holds the full traceback text
    #[error("{0}")]
    Raised(String),

    /// A value returned by user code has the wrong shape
    #[error("unexpected value from user code: {0}")]
    Conversion(String),

    /// Module files could not be written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterpreterError {
    /// Single-line summary suitable for an error record
    pub fn summary(&self) -> String {
        match self {
            InterpreterError::Raised(traceback) => last_meaningful_line(traceback).to_string(),
            other => last_meaningful_line(&other.to_string()).to_string(),
        }
    }

    /// Full traceback, when user code raised
    pub fn traceback(&self) -> Option<&str> {
        match self {
            InterpreterError::Raised(traceback) => Some(traceback),
            _ => None,
        }
    }
}

/// A running interpreter.
///
/// Arrays and callables are opaque handles owned by the interpreter; arrays
/// cross to the host only as [`ArrayPayload`]s.
pub trait Interpreter: Send {
    type Array;
    type Callable;

    /// Load interpreter packages by name
    fn load_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError>;

    /// Write `source` as module `module` and (re)import it, replacing any
    /// previous module of that name. Returns the module's exported names.
    fn install_module(&mut self, module: &str, source: &str) -> Result<Vec<String>, InterpreterError>;

    /// Look up a callable exported by an installed module
    fn lookup(&mut self, module: &str, name: &str) -> Result<Self::Callable, InterpreterError>;

    /// Call a preprocess function with the raw item bytes and the model's
    /// input names; returns the named arrays it produced
    fn call_preprocess(
        &mut self,
        function: &Self::Callable,
        input: &[u8],
        input_names: &[String],
    ) -> Result<Vec<(String, Self::Array)>, InterpreterError>;

    /// Call a postprocess function with the named outputs, the item context
    /// and the model's output names; returns a JSON-compatible payload
    fn call_postprocess(
        &mut self,
        function: &Self::Callable,
        outputs: Vec<(String, Self::Array)>,
        context: &Value,
        output_names: &[String],
    ) -> Result<Value, InterpreterError>;

    /// Copy an array out to the host
    fn export_array(&mut self, array: &Self::Array) -> Result<ArrayPayload, InterpreterError>;

    /// Build an array from a host payload
    fn import_array(&mut self, payload: ArrayPayload) -> Result<Self::Array, InterpreterError>;
}
