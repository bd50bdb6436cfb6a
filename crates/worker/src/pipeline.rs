//! Slice pipeline
//!
//! `run_work_function` is the worker entry point: it resolves the model
//! package, makes sure the process runtime is ready, loads the user
//! processors, then hands the items to `run_slice`. Setup failures abort the
//! slice with a single error record; item failures are recorded against the
//! item and the loop moves on.

use crate::engine::{InferenceSession, SessionOptions};
use crate::interpreter::Interpreter;
use crate::loader::{load_processors, Processors};
use crate::package::ModelPackage;
use crate::progress::{ProgressSink, ProgressTracker, PROCESSORS_READY, SESSION_READY};
use crate::runtime::{Backend, RuntimeContext};
use crate::tensor::bridge;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sliceloop_common::config::WorkerConfig;
use sliceloop_common::{LatencyTimer, MetricsRegistry};
use sliceloop_proto::{ErrorRecord, FinalResult, ItemContext, ItemResult, Labels, Slice, StageCode, WorkRequest};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};

/// Where an item is in its pass through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    Decoding,
    Preprocessing,
    Inferring,
    Postprocessing,
    Done,
}

impl ItemStage {
    /// Error code for a failure in this stage
    pub fn error_code(&self) -> StageCode {
        match self {
            ItemStage::Decoding | ItemStage::Preprocessing => StageCode::Preprocess,
            ItemStage::Inferring => StageCode::Inference,
            ItemStage::Postprocessing | ItemStage::Done => StageCode::Postprocess,
        }
    }
}

/// Failure of one item, tagged with the stage it happened in
#[derive(Debug)]
struct ItemFailure {
    stage: ItemStage,
    message: String,
}

impl ItemFailure {
    fn new(stage: ItemStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Run every item of a slice through preprocess, inference and postprocess.
///
/// Items are processed one at a time in slice order. Every item id of the
/// slice appears exactly once in the result.
pub fn run_slice<S, I>(
    slice: &Slice,
    processors: &Processors<I::Callable>,
    session: &mut S,
    interpreter: &mut I,
    labels: &Labels,
    progress: &mut ProgressTracker<'_>,
    metrics: &MetricsRegistry,
) -> BTreeMap<String, ItemResult>
where
    S: InferenceSession,
    I: Interpreter,
{
    let total = slice.len();
    let mut results = BTreeMap::new();

    for (done, (item_id, encoded)) in slice.items.iter().enumerate() {
        let span = info_span!("item", item = %item_id);
        let _enter = span.enter();

        let context = ItemContext::new(item_id, labels);
        let result = match process_item(encoded, &context, processors, session, interpreter, metrics) {
            Ok(payload) => {
                metrics.pipeline.items_succeeded.inc();
                ItemResult::Output(payload)
            }
            Err(failure) => {
                let code = failure.stage.error_code();
                warn!(stage = ?failure.stage, "Item failed: {}", failure.message);
                metrics.record_item_failure(code);
                ItemResult::Error(ErrorRecord::item(code, item_id.as_str(), &failure.message))
            }
        };

        results.insert(item_id.clone(), result);
        progress.item_done(done + 1, total);
    }

    results
}

fn process_item<S, I>(
    encoded: &str,
    context: &ItemContext<'_>,
    processors: &Processors<I::Callable>,
    session: &mut S,
    interpreter: &mut I,
    metrics: &MetricsRegistry,
) -> Result<Value, ItemFailure>
where
    S: InferenceSession,
    I: Interpreter,
{
    let mut stage = ItemStage::Decoding;
    let input = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ItemFailure::new(stage, format!("invalid base64 input: {}", e)))?;

    stage = ItemStage::Preprocessing;
    let input_names = session.input_names().to_vec();
    let arrays = metrics
        .pipeline
        .preprocess_duration
        .time(|| interpreter.call_preprocess(&processors.preprocess, &input, &input_names))
        .map_err(|e| ItemFailure::new(stage, e.summary()))?;
    let feed = bridge::to_engine_feed::<I, S::Tensor>(interpreter, arrays)
        .map_err(|e| ItemFailure::new(stage, e.to_string()))?;

    stage = ItemStage::Inferring;
    let outputs = metrics
        .pipeline
        .inference_duration
        .time(|| session.run(feed))
        .map_err(|e| ItemFailure::new(stage, e.to_string()))?;

    stage = ItemStage::Postprocessing;
    let arrays = bridge::to_interpreter_arrays::<I, S::Tensor>(interpreter, &outputs)
        .map_err(|e| ItemFailure::new(stage, e.to_string()))?;
    let output_names = session.output_names().to_vec();
    let payload = metrics
        .pipeline
        .postprocess_duration
        .time(|| interpreter.call_postprocess(&processors.postprocess, arrays, &context.to_json(), &output_names))
        .map_err(|e| ItemFailure::new(stage, e.summary()))?;

    stage = ItemStage::Done;
    debug!(stage = ?stage, "Item processed");
    Ok(payload)
}

/// Worker-level pipeline settings
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub worker: WorkerConfig,
}

impl PipelineOptions {
    pub fn new(worker: WorkerConfig) -> Self {
        Self { worker }
    }
}

/// Give up on the whole slice with a single error record.
///
/// `code` is `pyodide` for interpreter bootstrap and loader failures and
/// `inference` when the inference session cannot be built; the latter is the
/// only slice-fatal use of a code that otherwise marks item failures. The
/// completion checkpoint is still reported.
fn abort(
    metrics: &MetricsRegistry,
    tracker: &mut ProgressTracker<'_>,
    code: StageCode,
    message: impl AsRef<str>,
) -> FinalResult {
    let record = ErrorRecord::slice(code, message);
    error!("Slice aborted: {}", record);
    metrics.pipeline.slices_aborted.inc();
    tracker.finish();
    FinalResult::Aborted(record)
}

/// Result for a work request that could not be decoded.
///
/// Reported like a failed package resolution, so every request a worker
/// reads still gets exactly one Final Result.
pub fn reject_request(reason: impl std::fmt::Display) -> FinalResult {
    let record = ErrorRecord::slice(StageCode::Pyodide, format!("malformed work request: {}", reason));
    error!("Request rejected: {}", record);
    FinalResult::Aborted(record)
}

/// Process one slice end to end.
///
/// Never fails: setup problems come back as `FinalResult::Aborted`, item
/// problems as error records inside `FinalResult::Completed`.
pub fn run_work_function<B: Backend>(
    runtime: &RuntimeContext<B>,
    request: &WorkRequest,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
) -> FinalResult {
    let span = info_span!(
        "slice",
        model = %request.labels.model_name,
        project = %request.labels.project_id,
        items = request.slice.len()
    );
    let _enter = span.enter();

    let start = Instant::now();
    let metrics = runtime.metrics();
    metrics.pipeline.slices_total.inc();

    let mut tracker = ProgressTracker::new(progress);
    tracker.checkpoint(0.0);

    let package = match ModelPackage::resolve(&request.args, request.module.as_ref()) {
        Ok(package) => package,
        Err(e) => return abort(metrics, &mut tracker, StageCode::Pyodide, e.to_string()),
    };

    let session_options = SessionOptions::from_config(&options.worker, request.labels.accelerated);
    let session = match runtime.ensure_session(&package.model, &session_options) {
        Ok(session) => session,
        Err(e) => return abort(metrics, &mut tracker, StageCode::Inference, e.to_string()),
    };
    tracker.checkpoint(SESSION_READY);

    let interpreter = match runtime.ensure_interpreter() {
        Ok(interpreter) => interpreter,
        Err(e) => return abort(metrics, &mut tracker, StageCode::Pyodide, e.summary()),
    };
    let mut interpreter = interpreter.lock();

    let mut packages = options.worker.base_packages.clone();
    packages.extend(package.packages.iter().cloned());
    if let Err(e) = runtime.ensure_packages(&mut interpreter, &packages) {
        return abort(metrics, &mut tracker, StageCode::Pyodide, e.summary());
    }

    let processors = match load_processors(&mut *interpreter, &package.preprocess, &package.postprocess) {
        Ok(processors) => processors,
        Err(e) => return abort(metrics, &mut tracker, StageCode::Pyodide, e.summary()),
    };
    tracker.checkpoint(PROCESSORS_READY);

    let mut session = session.lock();
    let results = run_slice(
        &request.slice,
        &processors,
        &mut *session,
        &mut *interpreter,
        &request.labels,
        &mut tracker,
        metrics,
    );
    tracker.finish();

    let failed = results.values().filter(|r| r.is_error()).count();
    info!(
        "Slice processed in {:?}: {} items, {} failed",
        start.elapsed(),
        results.len(),
        failed
    );

    FinalResult::Completed(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::testing::{FakeBackend, ScriptedInterpreter, ScriptedSession};
    use crate::engine::EngineError;
    use crate::package::ModelPackage;
    use crate::tensor::ArrayPayload;
    use serde_json::json;
    use std::cell::RefCell;

    const PRE: &str = "import numpy as np\n\ndef preprocess(data, input_names):\n    ...\n";
    const POST: &str = "def postprocess(outputs, labels, output_names):\n    ...\n";

    fn runtime(backend: FakeBackend) -> RuntimeContext<FakeBackend> {
        RuntimeContext::with_metrics(backend, MetricsRegistry::new())
    }

    fn echo_backend() -> FakeBackend {
        FakeBackend::new(ScriptedSession::echo(&["input"], &["output"]))
    }

    fn request(items: &[(&str, &[u8])], preprocess: &str, postprocess: &str) -> WorkRequest {
        let mut slice = Slice::new();
        for (id, data) in items {
            slice.insert(*id, STANDARD.encode(data));
        }

        let package = ModelPackage {
            model: b"onnx".to_vec(),
            preprocess: preprocess.to_string(),
            postprocess: postprocess.to_string(),
            packages: vec!["numpy".to_string()],
        };

        WorkRequest {
            slice,
            labels: Labels::new("mnist", "project-1"),
            args: package.to_work_args(),
            module: None,
        }
    }

    fn run(runtime: &RuntimeContext<FakeBackend>, request: &WorkRequest) -> (FinalResult, Vec<f64>) {
        let seen = RefCell::new(Vec::new());
        let sink = |f: f64| seen.borrow_mut().push(f);
        let result = run_work_function(runtime, request, &PipelineOptions::default(), &sink);
        (result, seen.into_inner())
    }

    #[test]
    fn test_every_item_gets_a_result() {
        let runtime = runtime(echo_backend());
        let request = request(&[("a.png", b"\x01\x02"), ("b.png", b"\x03"), ("c.png", b"")], PRE, POST);

        let (result, progress) = run(&runtime, &request);

        let items = result.items().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.values().all(|r| !r.is_error()));
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[test]
    fn test_two_item_scenario() {
        let runtime = runtime(echo_backend());
        let request = request(&[("a.png", b"\x89PNG"), ("b.png", b"\x89PNG\x00")], PRE, POST);

        let (result, progress) = run(&runtime, &request);

        let a = result.get("a.png").and_then(|r| r.output()).unwrap();
        assert_eq!(a["fileID"], json!("a.png"));
        assert_eq!(a["outputs"]["output"]["shape"], json!([4]));
        let b = result.get("b.png").and_then(|r| r.output()).unwrap();
        assert_eq!(b["fileID"], json!("b.png"));

        assert_eq!(progress.len(), 5);
        let increments: Vec<f64> = progress.windows(2).skip(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(increments.len(), 2);
        assert!(increments.iter().all(|d| (d - 0.4).abs() < 1e-9));
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[test]
    fn test_preprocess_failure_is_item_local() {
        let interpreter = ScriptedInterpreter::new().on_preprocess(|data, names| {
            if data == b"corrupt" {
                return Err("cannot identify image file".to_string());
            }
            let tensor = crate::tensor::TensorDescriptor::from_elements(vec![1], &[1.0f32]).map_err(|e| e.to_string())?;
            Ok(names.iter().map(|n| (n.clone(), ArrayPayload::from_descriptor(&tensor))).collect())
        });
        let runtime = runtime(echo_backend().with_interpreter(interpreter));
        let request = request(&[("a.png", b"ok"), ("x.png", b"corrupt"), ("z.png", b"ok")], PRE, POST);

        let (result, _) = run(&runtime, &request);

        let record = result.get("x.png").and_then(|r| r.error()).unwrap();
        assert_eq!(record.code, StageCode::Preprocess);
        assert_eq!(record.item_id.as_deref(), Some("x.png"));
        assert_eq!(record.message, "ValueError: cannot identify image file");
        assert!(result.get("a.png").unwrap().output().is_some());
        assert!(result.get("z.png").unwrap().output().is_some());
        assert_eq!(runtime.metrics().item_failures(StageCode::Preprocess), 1);
    }

    #[test]
    fn test_bad_base64_is_preprocess_error() {
        let runtime = runtime(echo_backend());
        let mut request = request(&[("a.png", b"ok")], PRE, POST);
        request.slice.insert("broken.png", "%%%");

        let (result, _) = run(&runtime, &request);

        let record = result.get("broken.png").and_then(|r| r.error()).unwrap();
        assert_eq!(record.code, StageCode::Preprocess);
        assert!(record.message.starts_with("invalid base64 input"));
        assert!(result.get("a.png").unwrap().output().is_some());
    }

    #[test]
    fn test_unsupported_dtype_is_preprocess_error() {
        let interpreter = ScriptedInterpreter::new().on_preprocess(|_, names| {
            Ok(names
                .iter()
                .map(|n| {
                    let payload = ArrayPayload {
                        dtype: "complex128".to_string(),
                        shape: vec![1],
                        data: vec![0; 16],
                    };
                    (n.clone(), payload)
                })
                .collect())
        });
        let runtime = runtime(echo_backend().with_interpreter(interpreter));
        let request = request(&[("a.png", b"ok")], PRE, POST);

        let (result, _) = run(&runtime, &request);

        let record = result.get("a.png").and_then(|r| r.error()).unwrap();
        assert_eq!(record.code, StageCode::Preprocess);
        assert_eq!(record.message, "unsupported dtype: complex128");
    }

    #[test]
    fn test_inference_failure_is_item_local() {
        let session = ScriptedSession::echo(&["input"], &["output"]).with_behavior(|feed| {
            let (_, tensor) = feed.first().ok_or_else(|| EngineError::Run("empty feed".to_string()))?;
            if tensor.num_elements() > 2 {
                return Err(EngineError::Run("Got invalid dimensions for input: input".to_string()));
            }
            Ok(vec![("output".to_string(), tensor.clone())])
        });
        let runtime = runtime(FakeBackend::new(session));
        let request = request(&[("big.png", b"\x01\x02\x03"), ("small.png", b"\x01")], PRE, POST);

        let (result, _) = run(&runtime, &request);

        let record = result.get("big.png").and_then(|r| r.error()).unwrap();
        assert_eq!(record.code, StageCode::Inference);
        assert_eq!(record.message, "inference failed: Got invalid dimensions for input: input");
        assert!(result.get("small.png").unwrap().output().is_some());
    }

    #[test]
    fn test_postprocess_failure_is_item_local() {
        let interpreter = ScriptedInterpreter::new().on_postprocess(|_, context, _| {
            if context["fileID"] == json!("b.png") {
                return Err("index out of range".to_string());
            }
            Ok(json!({ "label": 7 }))
        });
        let runtime = runtime(echo_backend().with_interpreter(interpreter));
        let request = request(&[("a.png", b"1"), ("b.png", b"2")], PRE, POST);

        let (result, _) = run(&runtime, &request);

        let record = result.get("b.png").and_then(|r| r.error()).unwrap();
        assert_eq!(record.code, StageCode::Postprocess);
        assert_eq!(record.item_id.as_deref(), Some("b.png"));
        assert_eq!(result.get("a.png").unwrap().output(), Some(&json!({ "label": 7 })));
    }

    #[test]
    fn test_postprocess_receives_labels() {
        let interpreter = ScriptedInterpreter::new().on_postprocess(|_, context, names| {
            Ok(json!({ "context": context.clone(), "names": names }))
        });
        let runtime = runtime(echo_backend().with_interpreter(interpreter));
        let mut request = request(&[("a.png", b"1")], PRE, POST);
        request.labels.extra.insert("threshold".to_string(), json!(0.5));

        let (result, _) = run(&runtime, &request);

        let payload = result.get("a.png").and_then(|r| r.output()).unwrap();
        assert_eq!(payload["context"]["fileID"], json!("a.png"));
        assert_eq!(payload["context"]["modelName"], json!("mnist"));
        assert_eq!(payload["context"]["threshold"], json!(0.5));
        assert_eq!(payload["names"], json!(["output"]));
    }

    #[test]
    fn test_stale_file_id_label_is_replaced_per_item() {
        let interpreter = ScriptedInterpreter::new()
            .on_postprocess(|_, context, _| Ok(json!({ "fileID": context["fileID"].clone() })));
        let runtime = runtime(echo_backend().with_interpreter(interpreter));
        let mut request = request(&[("a.png", b"1"), ("b.png", b"2")], PRE, POST);
        request.labels = serde_json::from_value(json!({
            "modelName": "m",
            "projectID": "p",
            "fileID": "stale.png"
        }))
        .unwrap();

        let (result, _) = run(&runtime, &request);

        for id in ["a.png", "b.png"] {
            let payload = result.get(id).and_then(|r| r.output()).unwrap();
            assert_eq!(payload["fileID"], json!(id));
        }
    }

    #[test]
    fn test_loader_failure_aborts_slice() {
        let runtime = runtime(echo_backend());
        let request = request(&[("a.png", b"1"), ("b.png", b"2")], "def run(data):\n    ...\n", POST);

        let (result, progress) = run(&runtime, &request);

        let record = result.abort_reason().unwrap();
        assert_eq!(record.code, StageCode::Pyodide);
        assert!(record.item_id.is_none());
        assert!(result.items().is_none());
        assert_eq!(progress, vec![0.0, 0.1, 1.0]);
        assert_eq!(runtime.metrics().pipeline.slices_aborted.get(), 1);
    }

    #[test]
    fn test_import_error_uses_last_traceback_line() {
        let runtime = runtime(echo_backend());
        let request = request(&[("a.png", b"1")], "import cv2\ndef preprocess(data, names):\n    ...\n", POST);

        // opencv is available in the scripted interpreter; an unknown module is not.
        let (ok, _) = run(&runtime, &request);
        assert!(!ok.is_aborted());

        let request = self::request(&[("a.png", b"1")], "import torch\ndef preprocess(data, names):\n    ...\n", POST);
        let (result, _) = run(&runtime, &request);

        assert_eq!(
            result.abort_reason().unwrap().message,
            "ModuleNotFoundError: No module named 'torch'"
        );
    }

    #[test]
    fn test_ambiguous_postprocess_aborts_slice() {
        let runtime = runtime(echo_backend());
        let post = "def postprocess_boxes(o, l, n):\n    ...\ndef postprocess_masks(o, l, n):\n    ...\n";
        let request = request(&[("a.png", b"1")], PRE, post);

        let (result, _) = run(&runtime, &request);

        let record = result.abort_reason().unwrap();
        assert_eq!(record.code, StageCode::Pyodide);
        assert!(record.message.contains("several postprocess functions"));
    }

    #[test]
    fn test_session_failure_aborts_slice() {
        let backend = echo_backend().fail_sessions(1);
        let counters = backend.counters();
        let runtime = runtime(backend);
        let request = request(&[("a.png", b"1")], PRE, POST);

        let (result, progress) = run(&runtime, &request);
        assert_eq!(result.abort_reason().unwrap().code, StageCode::Inference);
        assert_eq!(progress, vec![0.0, 1.0]);

        // The next slice retries the session.
        let (result, _) = run(&runtime, &request);
        assert!(!result.is_aborted());
        assert_eq!(counters.session_builds(), 2);
    }

    #[test]
    fn test_interpreter_failure_aborts_slice() {
        let runtime = runtime(echo_backend().fail_interpreters(1));
        let request = request(&[("a.png", b"1")], PRE, POST);

        let (result, _) = run(&runtime, &request);

        let record = result.abort_reason().unwrap();
        assert_eq!(record.code, StageCode::Pyodide);
        assert_eq!(record.message, "interpreter failed to start: interpreter runtime unavailable");
    }

    #[test]
    fn test_missing_package_aborts_slice() {
        let runtime = runtime(echo_backend());
        let mut request = request(&[("a.png", b"1")], PRE, POST);
        request.args.model = None;

        let (result, _) = run(&runtime, &request);

        assert_eq!(result.abort_reason().unwrap().code, StageCode::Pyodide);
    }

    #[test]
    fn test_runtime_reused_across_slices() {
        let backend = echo_backend();
        let counters = backend.counters();
        let runtime = runtime(backend);

        for _ in 0..3 {
            let request = request(&[("a.png", b"1")], PRE, POST);
            let (result, _) = run(&runtime, &request);
            assert!(!result.is_aborted());
        }

        assert_eq!(counters.session_builds(), 1);
        assert_eq!(counters.interpreter_starts(), 1);
        assert_eq!(counters.package_loads(), 1);
    }

    #[test]
    fn test_processors_replaced_between_slices() {
        let runtime = runtime(echo_backend());

        let first = request(&[("a.png", b"1")], PRE, POST);
        assert!(!run(&runtime, &first).0.is_aborted());

        let second = request(&[("a.png", b"1")], PRE, "def summarize(o, l, n):\n    ...\n");
        let (result, _) = run(&runtime, &second);
        assert!(result.abort_reason().unwrap().message.contains("no postprocess function"));
    }

    #[test]
    fn test_malformed_request_is_rejected_with_one_line() {
        let err = serde_json::from_str::<WorkRequest>("{\"slice\": 7}").unwrap_err();

        let result = reject_request(&err);

        let record = result.abort_reason().unwrap();
        assert_eq!(record.code, StageCode::Pyodide);
        assert!(record.message.starts_with("malformed work request: "));
        assert!(!record.message.contains('\n'));
        assert!(record.item_id.is_none());
    }

    #[test]
    fn test_empty_slice() {
        let runtime = runtime(echo_backend());
        let request = request(&[], PRE, POST);

        let (result, progress) = run(&runtime, &request);

        assert_eq!(result.items().map(|i| i.len()), Some(0));
        assert_eq!(progress, vec![0.0, 0.1, 0.2, 1.0]);
    }

    #[test]
    fn test_no_progress_sink() {
        let runtime = runtime(echo_backend());
        let request = request(&[("a.png", b"1")], PRE, POST);

        let result = run_work_function(&runtime, &request, &PipelineOptions::default(), &NoProgress);
        assert!(!result.is_aborted());
    }
}
