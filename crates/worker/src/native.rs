//! Production backend: ONNX Runtime sessions and embedded CPython

use crate::engine::onnx::OrtSession;
use crate::engine::{EngineError, SessionOptions};
use crate::interpreter::python::PythonInterpreter;
use crate::interpreter::InterpreterError;
use crate::runtime::Backend;
use sliceloop_common::config::WorkerConfig;
use std::path::PathBuf;

/// Backend building [`OrtSession`]s and a [`PythonInterpreter`]
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    module_dir: Option<PathBuf>,
}

impl NativeBackend {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            module_dir: config.module_dir.clone(),
        }
    }
}

impl Backend for NativeBackend {
    type Session = OrtSession;
    type Interpreter = PythonInterpreter;

    fn create_session(&self, model: &[u8], options: &SessionOptions) -> Result<OrtSession, EngineError> {
        OrtSession::from_memory(model, options)
    }

    fn start_interpreter(&self) -> Result<PythonInterpreter, InterpreterError> {
        PythonInterpreter::start(self.module_dir.clone())
    }
}
