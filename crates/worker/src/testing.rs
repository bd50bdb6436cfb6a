//! In-memory backend for exercising the pipeline without ONNX Runtime or
//! CPython.
//!
//! `ScriptedInterpreter` understands just enough of a module source to be
//! useful: `def name(` lines export `name`, `import x` / `import x as y` lines
//! export the bound name and fail when `x` is not an available package, and a
//! `raise ...` line fails the import with that line as the exception. Calls to
//! the resolved functions run Rust closures.

use crate::engine::{EngineError, InferenceSession, NamedTensors, SessionOptions};
use crate::interpreter::{Interpreter, InterpreterError};
use crate::loader::{POSTPROCESS_MODULE, PREPROCESS_MODULE};
use crate::runtime::Backend;
use crate::tensor::{ArrayPayload, DType, TensorDescriptor};
use serde_json::{json, Map, Value};
use sliceloop_common::ProviderPreference;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Initialization counters shared by a fake backend and what it builds
#[derive(Debug, Default)]
pub struct Counters {
    session_builds: AtomicUsize,
    interpreter_starts: AtomicUsize,
    package_loads: AtomicUsize,
}

impl Counters {
    /// Session build attempts
    pub fn session_builds(&self) -> usize {
        self.session_builds.load(Ordering::SeqCst)
    }

    /// Interpreter start attempts
    pub fn interpreter_starts(&self) -> usize {
        self.interpreter_starts.load(Ordering::SeqCst)
    }

    /// Packages loaded, one per package
    pub fn package_loads(&self) -> usize {
        self.package_loads.load(Ordering::SeqCst)
    }
}

type RunFn = dyn Fn(NamedTensors<TensorDescriptor>) -> Result<NamedTensors<TensorDescriptor>, EngineError> + Send + Sync;

/// Session that runs a closure over descriptors
#[derive(Clone)]
pub struct ScriptedSession {
    inputs: Vec<String>,
    outputs: Vec<String>,
    provider: ProviderPreference,
    behavior: Arc<RunFn>,
}

impl ScriptedSession {
    /// Session copying the i-th declared input to the i-th declared output
    pub fn echo(inputs: &[&str], outputs: &[&str]) -> Self {
        let input_names: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        let output_names: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();

        let (ins, outs) = (input_names.clone(), output_names.clone());
        let behavior = move |feed: NamedTensors<TensorDescriptor>| {
            let mut results = Vec::with_capacity(outs.len());
            for (index, output) in outs.iter().enumerate() {
                let input = ins.get(index).or_else(|| ins.first()).ok_or_else(|| {
                    EngineError::Run("model declares no inputs".to_string())
                })?;
                let tensor = feed
                    .iter()
                    .find(|(name, _)| name == input)
                    .map(|(_, tensor)| tensor.clone())
                    .ok_or_else(|| EngineError::Run(format!("missing input: {}", input)))?;
                results.push((output.clone(), tensor));
            }
            Ok(results)
        };

        Self {
            inputs: input_names,
            outputs: output_names,
            provider: ProviderPreference::Cpu,
            behavior: Arc::new(behavior),
        }
    }

    /// Replace the run behavior
    pub fn with_behavior<F>(mut self, behavior: F) -> Self
    where
        F: Fn(NamedTensors<TensorDescriptor>) -> Result<NamedTensors<TensorDescriptor>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.behavior = Arc::new(behavior);
        self
    }
}

impl InferenceSession for ScriptedSession {
    type Tensor = TensorDescriptor;

    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn provider(&self) -> ProviderPreference {
        self.provider
    }

    fn run(&mut self, feed: NamedTensors<TensorDescriptor>) -> Result<NamedTensors<TensorDescriptor>, EngineError> {
        (self.behavior)(feed)
    }
}

/// Callable handle: the module and function it was resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCallable {
    pub module: String,
    pub name: String,
}

impl ScriptedCallable {
    /// `module.name`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

type PreprocessFn = dyn Fn(&[u8], &[String]) -> Result<Vec<(String, ArrayPayload)>, String> + Send + Sync;
type PostprocessFn = dyn Fn(Vec<(String, ArrayPayload)>, &Value, &[String]) -> Result<Value, String> + Send + Sync;

/// Interpreter whose user functions are Rust closures
#[derive(Clone)]
pub struct ScriptedInterpreter {
    available_packages: BTreeSet<String>,
    modules: HashMap<String, Vec<String>>,
    preprocess: Arc<PreprocessFn>,
    postprocess: Arc<PostprocessFn>,
    counters: Arc<Counters>,
}

impl ScriptedInterpreter {
    /// Interpreter with `numpy`, `pillow` and `opencv-python` available.
    ///
    /// The default preprocess turns every input byte into a float32 element
    /// for each requested input name; the default postprocess reports the
    /// item id and each output's dtype and shape.
    pub fn new() -> Self {
        Self {
            available_packages: ["numpy", "pillow", "opencv-python"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            modules: HashMap::new(),
            preprocess: Arc::new(default_preprocess),
            postprocess: Arc::new(default_postprocess),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace the preprocess behavior; an `Err` is raised as a `ValueError`
    pub fn on_preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8], &[String]) -> Result<Vec<(String, ArrayPayload)>, String> + Send + Sync + 'static,
    {
        self.preprocess = Arc::new(f);
        self
    }

    /// Replace the postprocess behavior; an `Err` is raised as a `ValueError`
    pub fn on_postprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<(String, ArrayPayload)>, &Value, &[String]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.postprocess = Arc::new(f);
        self
    }

    fn with_counters(mut self, counters: Arc<Counters>) -> Self {
        self.counters = counters;
        self
    }
}

impl Default for ScriptedInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn default_preprocess(data: &[u8], input_names: &[String]) -> Result<Vec<(String, ArrayPayload)>, String> {
    let values: Vec<f32> = data.iter().map(|&b| f32::from(b)).collect();
    let tensor = TensorDescriptor::from_elements(vec![values.len()], &values).map_err(|e| e.to_string())?;
    Ok(input_names
        .iter()
        .map(|name| (name.clone(), ArrayPayload::from_descriptor(&tensor)))
        .collect())
}

fn default_postprocess(
    outputs: Vec<(String, ArrayPayload)>,
    context: &Value,
    _output_names: &[String],
) -> Result<Value, String> {
    let mut described = Map::new();
    for (name, array) in outputs {
        described.insert(name, json!({ "dtype": array.dtype, "shape": array.shape }));
    }
    Ok(json!({
        "fileID": context.get("fileID").cloned().unwrap_or(Value::Null),
        "outputs": described,
    }))
}

fn traceback(module: &str, line: usize, exception: &str) -> InterpreterError {
    InterpreterError::Raised(format!(
        "Traceback (most recent call last):\n  File \"{}.py\", line {}, in <module>\n{}\n",
        module, line, exception
    ))
}

fn value_error(function: &ScriptedCallable, message: &str) -> InterpreterError {
    InterpreterError::Raised(format!(
        "Traceback (most recent call last):\n  File \"{}.py\", in {}\nValueError: {}\n",
        function.module, function.name, message
    ))
}

impl Interpreter for ScriptedInterpreter {
    type Array = ArrayPayload;
    type Callable = ScriptedCallable;

    fn load_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        for package in packages {
            if !self.available_packages.contains(package) {
                return Err(InterpreterError::Package {
                    package: package.clone(),
                    message: format!("No known package with name '{}'", package),
                });
            }
            self.counters.package_loads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn install_module(&mut self, module: &str, source: &str) -> Result<Vec<String>, InterpreterError> {
        self.modules.remove(module);

        let mut names = vec!["__name__".to_string(), "__file__".to_string()];
        for (index, line) in source.lines().enumerate() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("def ") {
                if let Some(name) = rest.split('(').next() {
                    names.push(name.trim().to_string());
                }
            } else if let Some(rest) = line.strip_prefix("import ") {
                let mut parts = rest.split_whitespace();
                let package = parts.next().unwrap_or_default();
                let bound = match (parts.next(), parts.next()) {
                    (Some("as"), Some(alias)) => alias,
                    _ => package,
                };
                let known = self.available_packages.iter().any(|p| p == package)
                    || (package == "cv2" && self.available_packages.contains("opencv-python"))
                    || (package == "PIL" && self.available_packages.contains("pillow"));
                if !known {
                    return Err(traceback(
                        module,
                        index + 1,
                        &format!("ModuleNotFoundError: No module named '{}'", package),
                    ));
                }
                names.push(bound.to_string());
            } else if let Some(rest) = line.strip_prefix("raise ") {
                return Err(traceback(module, index + 1, rest));
            }
        }

        names.sort();
        self.modules.insert(module.to_string(), names.clone());
        Ok(names)
    }

    fn lookup(&mut self, module: &str, name: &str) -> Result<Self::Callable, InterpreterError> {
        let names = self
            .modules
            .get(module)
            .ok_or_else(|| InterpreterError::Conversion(format!("module {} is not installed", module)))?;

        if !names.iter().any(|n| n == name) {
            return Err(InterpreterError::Raised(format!(
                "AttributeError: module '{}' has no attribute '{}'",
                module, name
            )));
        }

        Ok(ScriptedCallable {
            module: module.to_string(),
            name: name.to_string(),
        })
    }

    fn call_preprocess(
        &mut self,
        function: &Self::Callable,
        input: &[u8],
        input_names: &[String],
    ) -> Result<Vec<(String, Self::Array)>, InterpreterError> {
        if function.module != PREPROCESS_MODULE {
            return Err(InterpreterError::Conversion(format!("{} is not a preprocess function", function.qualified())));
        }
        (self.preprocess)(input, input_names).map_err(|message| value_error(function, &message))
    }

    fn call_postprocess(
        &mut self,
        function: &Self::Callable,
        outputs: Vec<(String, Self::Array)>,
        context: &Value,
        output_names: &[String],
    ) -> Result<Value, InterpreterError> {
        if function.module != POSTPROCESS_MODULE {
            return Err(InterpreterError::Conversion(format!("{} is not a postprocess function", function.qualified())));
        }
        (self.postprocess)(outputs, context, output_names).map_err(|message| value_error(function, &message))
    }

    fn export_array(&mut self, array: &Self::Array) -> Result<ArrayPayload, InterpreterError> {
        Ok(array.clone())
    }

    fn import_array(&mut self, payload: ArrayPayload) -> Result<Self::Array, InterpreterError> {
        if DType::from_name(&payload.dtype).is_none() {
            return Err(InterpreterError::Conversion(format!("data type '{}' not understood", payload.dtype)));
        }
        Ok(payload)
    }
}

/// Backend building scripted sessions and interpreters
pub struct FakeBackend {
    session: ScriptedSession,
    interpreter: ScriptedInterpreter,
    failing_sessions: AtomicUsize,
    failing_interpreters: AtomicUsize,
    counters: Arc<Counters>,
}

impl FakeBackend {
    /// Backend with the given session and a default interpreter
    pub fn new(session: ScriptedSession) -> Self {
        Self {
            session,
            interpreter: ScriptedInterpreter::new(),
            failing_sessions: AtomicUsize::new(0),
            failing_interpreters: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use this interpreter template
    pub fn with_interpreter(mut self, interpreter: ScriptedInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Fail the next `count` session builds
    pub fn fail_sessions(self, count: usize) -> Self {
        self.failing_sessions.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` interpreter starts
    pub fn fail_interpreters(self, count: usize) -> Self {
        self.failing_interpreters.store(count, Ordering::SeqCst);
        self
    }

    /// Shared initialization counters
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}

/// Decrement a failure budget; true when this attempt should fail
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Backend for FakeBackend {
    type Session = ScriptedSession;
    type Interpreter = ScriptedInterpreter;

    fn create_session(&self, model: &[u8], options: &SessionOptions) -> Result<ScriptedSession, EngineError> {
        self.counters.session_builds.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.failing_sessions) {
            return Err(EngineError::SessionCreation(format!(
                "failed to load model with error: protobuf parsing failed ({} bytes)",
                model.len()
            )));
        }

        let mut session = self.session.clone();
        session.provider = options.provider;
        Ok(session)
    }

    fn start_interpreter(&self) -> Result<ScriptedInterpreter, InterpreterError> {
        self.counters.interpreter_starts.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.failing_interpreters) {
            return Err(InterpreterError::Startup("interpreter runtime unavailable".to_string()));
        }

        Ok(self.interpreter.clone().with_counters(self.counters()))
    }
}
