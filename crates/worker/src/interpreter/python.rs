//! CPython interpreter backed by pyo3
//!
//! User modules are written to a private directory placed at the front of
//! `sys.path` and imported by name. NumPy is the array library on the Python
//! side; every crossing goes through the small helper module below.

use super::{Interpreter, InterpreterError};
use crate::tensor::ArrayPayload;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList, PyModule};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const HELPER_MODULE: &str = "_sliceloop_bridge";

const HELPER_SOURCE: &str = r#"
import importlib
import json
import sys

sys.dont_write_bytecode = True


def install(name):
    sys.modules.pop(name, None)
    importlib.invalidate_caches()
    module = importlib.import_module(name)
    return module, list(dir(module))


def _little_endian(array):
    import numpy as np
    array = np.ascontiguousarray(array)
    return array.astype(array.dtype.newbyteorder("<"), copy=False)


def run_preprocess(fn, data, input_names):
    import numpy as np
    feed = fn(data, np.array(input_names))
    if not isinstance(feed, dict):
        raise TypeError("preprocess must return a dict of arrays, got %s" % type(feed).__name__)
    return [(str(key), _little_endian(array)) for key, array in feed.items()]


def describe(array):
    array = _little_endian(array)
    return array.dtype.name, list(array.shape), array.tobytes()


def make_array(dtype, shape, data):
    import numpy as np
    if len(data) == 0:
        return np.zeros(shape, dtype=dtype)
    return np.frombuffer(data, dtype=dtype).reshape(shape).copy()


def _jsonable(value):
    if hasattr(value, "tolist"):
        return value.tolist()
    if hasattr(value, "item"):
        return value.item()
    raise TypeError("%s is not JSON serializable" % type(value).__name__)


def run_postprocess(fn, outputs, context, output_names):
    result = fn(dict(outputs), json.loads(context), list(output_names))
    return json.dumps(result, default=_jsonable)
"#;

/// Distribution names whose import name differs
const IMPORT_ALIASES: &[(&str, &str)] = &[
    ("opencv-python", "cv2"),
    ("opencv-python-headless", "cv2"),
    ("pillow", "PIL"),
    ("scikit-learn", "sklearn"),
    ("scikit-image", "skimage"),
    ("pyyaml", "yaml"),
];

/// Import name for a package
pub fn import_name(package: &str) -> String {
    let lowered = package.to_ascii_lowercase();
    IMPORT_ALIASES
        .iter()
        .find(|(dist, _)| *dist == lowered)
        .map(|(_, module)| module.to_string())
        .unwrap_or_else(|| package.replace('-', "_"))
}

enum ModuleDir {
    Owned(TempDir),
    Shared(PathBuf),
}

impl ModuleDir {
    fn path(&self) -> &Path {
        match self {
            ModuleDir::Owned(dir) => dir.path(),
            ModuleDir::Shared(path) => path,
        }
    }
}

/// Embedded CPython interpreter
pub struct PythonInterpreter {
    module_dir: ModuleDir,
    helper: Py<PyModule>,
    modules: HashMap<String, Py<PyModule>>,
}

impl PythonInterpreter {
    /// Start the interpreter. Modules are written to `module_dir`, or to a
    /// private temporary directory when `None`.
    pub fn start(module_dir: Option<PathBuf>) -> Result<Self, InterpreterError> {
        let module_dir = match module_dir {
            Some(path) => {
                std::fs::create_dir_all(&path)?;
                ModuleDir::Shared(path)
            }
            None => ModuleDir::Owned(tempfile::Builder::new().prefix("sliceloop-modules").tempdir()?),
        };

        let dir = module_dir.path().to_string_lossy().into_owned();
        let source = CString::new(HELPER_SOURCE).map_err(|e| InterpreterError::Startup(e.to_string()))?;
        let file_name = CString::new(format!("{}.py", HELPER_MODULE))
            .map_err(|e| InterpreterError::Startup(e.to_string()))?;
        let module_name = CString::new(HELPER_MODULE).map_err(|e| InterpreterError::Startup(e.to_string()))?;

        let helper = Python::attach(|py| -> PyResult<Py<PyModule>> {
            let sys = py.import("sys")?;
            sys.getattr("path")?.call_method1("insert", (0, dir.as_str()))?;
            let helper = PyModule::from_code(py, &source, &file_name, &module_name)?;
            Ok(helper.unbind())
        })
        .map_err(|e| InterpreterError::Startup(Python::attach(|py| format_error(py, &e))))?;

        info!("Python interpreter started, modules in {}", dir);

        Ok(Self {
            module_dir,
            helper,
            modules: HashMap::new(),
        })
    }

    /// Directory user modules are written to
    pub fn module_dir(&self) -> &Path {
        self.module_dir.path()
    }
}

/// Full traceback text of a Python exception, ending with `Type: message`
fn format_error(py: Python<'_>, err: &PyErr) -> String {
    let traceback = err
        .traceback(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    format!("{}{}", traceback, err)
}

fn raised(py: Python<'_>, err: PyErr) -> InterpreterError {
    InterpreterError::Raised(format_error(py, &err))
}

impl Interpreter for PythonInterpreter {
    type Array = Py<PyAny>;
    type Callable = Py<PyAny>;

    fn load_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        Python::attach(|py| {
            for package in packages {
                let module = import_name(package);
                py.import(module.as_str()).map_err(|e| InterpreterError::Package {
                    package: package.clone(),
                    message: e.to_string(),
                })?;
                debug!("Loaded package {} ({})", package, module);
            }
            Ok(())
        })
    }

    fn install_module(&mut self, module: &str, source: &str) -> Result<Vec<String>, InterpreterError> {
        let path = self.module_dir.path().join(format!("{}.py", module));
        std::fs::write(&path, source)?;

        let helper = &self.helper;
        let (handle, names) = Python::attach(|py| {
            let installed = helper
                .bind(py)
                .call_method1("install", (module,))
                .map_err(|e| raised(py, e))?;
            let (handle, names): (Bound<'_, PyModule>, Vec<String>) =
                installed.extract().map_err(|e| raised(py, e.into()))?;
            Ok::<_, InterpreterError>((handle.unbind(), names))
        })?;

        debug!("Installed module {} ({} names)", module, names.len());
        self.modules.insert(module.to_string(), handle);
        Ok(names)
    }

    fn lookup(&mut self, module: &str, name: &str) -> Result<Self::Callable, InterpreterError> {
        let handle = self
            .modules
            .get(module)
            .ok_or_else(|| InterpreterError::Conversion(format!("module {} is not installed", module)))?;

        Python::attach(|py| {
            let function = handle.bind(py).getattr(name).map_err(|e| raised(py, e))?;
            if !function.is_callable() {
                return Err(InterpreterError::Conversion(format!("{}.{} is not callable", module, name)));
            }
            Ok(function.unbind())
        })
    }

    fn call_preprocess(
        &mut self,
        function: &Self::Callable,
        input: &[u8],
        input_names: &[String],
    ) -> Result<Vec<(String, Self::Array)>, InterpreterError> {
        let helper = &self.helper;
        Python::attach(|py| {
            let data = PyBytes::new(py, input);
            let names = PyList::new(py, input_names).map_err(|e| raised(py, e))?;
            let feed = helper
                .bind(py)
                .call_method1("run_preprocess", (function.bind(py), data, names))
                .map_err(|e| raised(py, e))?;
            let feed: Vec<(String, Bound<'_, PyAny>)> = feed.extract().map_err(|e| raised(py, e.into()))?;
            Ok(feed.into_iter().map(|(name, array)| (name, array.unbind())).collect())
        })
    }

    fn call_postprocess(
        &mut self,
        function: &Self::Callable,
        outputs: Vec<(String, Self::Array)>,
        context: &Value,
        output_names: &[String],
    ) -> Result<Value, InterpreterError> {
        let context = serde_json::to_string(context).map_err(|e| InterpreterError::Conversion(e.to_string()))?;
        let helper = &self.helper;

        let rendered = Python::attach(|py| {
            let outputs = PyList::new(
                py,
                outputs.iter().map(|(name, array)| (name.as_str(), array.bind(py))),
            )
            .map_err(|e| raised(py, e))?;
            let names = PyList::new(py, output_names).map_err(|e| raised(py, e))?;
            helper
                .bind(py)
                .call_method1("run_postprocess", (function.bind(py), outputs, context.as_str(), names))
                .and_then(|result| result.extract::<String>().map_err(PyErr::from))
                .map_err(|e| raised(py, e))
        })?;

        serde_json::from_str(&rendered).map_err(|e| InterpreterError::Conversion(e.to_string()))
    }

    fn export_array(&mut self, array: &Self::Array) -> Result<ArrayPayload, InterpreterError> {
        let helper = &self.helper;
        Python::attach(|py| {
            let described = helper
                .bind(py)
                .call_method1("describe", (array.bind(py),))
                .map_err(|e| raised(py, e))?;
            let (dtype, shape, data): (String, Vec<usize>, Bound<'_, PyBytes>) =
                described.extract().map_err(|e| raised(py, e.into()))?;
            Ok(ArrayPayload {
                dtype,
                shape,
                data: data.as_bytes().to_vec(),
            })
        })
    }

    fn import_array(&mut self, payload: ArrayPayload) -> Result<Self::Array, InterpreterError> {
        let helper = &self.helper;
        Python::attach(|py| {
            let data = PyBytes::new(py, &payload.data);
            let shape = PyList::new(py, &payload.shape).map_err(|e| raised(py, e))?;
            let array = helper
                .bind(py)
                .call_method1("make_array", (payload.dtype.as_str(), shape, data))
                .map_err(|e| raised(py, e))?;
            Ok(array.unbind())
        })
    }
}
