//! SliceLoop Worker
//!
//! Runs one slice of input files through user preprocess code, an inference
//! session and user postprocess code. The session and the interpreter live in
//! a per-process [`RuntimeContext`] and are reused by every slice.

pub mod engine;
pub mod interpreter;
pub mod loader;
pub mod package;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod tensor;
pub mod testing;

#[cfg(all(feature = "onnx", feature = "python"))]
pub mod native;

pub use engine::{EngineError, InferenceSession, SessionOptions};
pub use interpreter::{Interpreter, InterpreterError};
pub use loader::{load_processors, LoaderError, Processors};
pub use package::{ModelPackage, PackageError};
pub use pipeline::{reject_request, run_slice, run_work_function, PipelineOptions};
pub use progress::{NoProgress, ProgressSink, ProgressTracker};
pub use runtime::{Backend, RuntimeContext};
pub use tensor::{BridgeError, DType, TensorDescriptor};
