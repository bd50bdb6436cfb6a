//! Job lifecycle
//!
//! A job pairs a list of slices with one model invocation. `exec` hands the
//! slices to a [`SliceExecutor`] one after another, publishes lifecycle
//! events on a broadcast channel and collects the Final Results.

use crate::artifacts::ArtifactStore;
use crate::publish::build_module;
use sliceloop_common::{Result, SliceLoopError};
use sliceloop_proto::{AttachedModule, FinalResult, Labels, ModelDescriptor, Slice, WorkArgs, WorkRequest};
use sliceloop_worker::{run_work_function, Backend, PipelineOptions, RuntimeContext};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the job event channel
const EVENT_CAPACITY: usize = 256;

/// How workers receive the model package
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Model and sources travel with every slice
    Bundled(WorkArgs),

    /// A published module supplies the package
    Attached(AttachedModule),
}

impl Invocation {
    /// Choose the invocation mode for a model descriptor.
    ///
    /// With an artifact directory (`artifact_dir`, else the descriptor's
    /// `modelDownload` relative to `base`) the package is fetched from the
    /// artifact store and bundled; otherwise it is attached as a module.
    pub fn from_descriptor(descriptor: &ModelDescriptor, base: &Path, artifact_dir: Option<&Path>) -> Result<Self> {
        let root = artifact_dir
            .map(Path::to_path_buf)
            .or_else(|| descriptor.model_download.as_ref().map(|dir| base.join(dir)));

        match root {
            Some(root) => {
                debug!("Bundling artifacts from {}", root.display());
                let store = ArtifactStore::new(descriptor.clone(), root);
                Ok(Invocation::Bundled(store.bundled_args()?))
            }
            None => Ok(Invocation::Attached(build_module(descriptor, base)?)),
        }
    }

    fn request(&self, slice: Slice, labels: Labels) -> WorkRequest {
        match self {
            Invocation::Bundled(args) => WorkRequest {
                slice,
                labels,
                args: args.clone(),
                module: None,
            },
            Invocation::Attached(module) => WorkRequest {
                slice,
                labels,
                args: WorkArgs::default(),
                module: Some(module.clone()),
            },
        }
    }
}

/// Compute group a job is restricted to
#[derive(Clone, PartialEq, Eq)]
pub struct ComputeGroup {
    pub join_key: String,
    pub join_secret: String,
}

impl fmt::Debug for ComputeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeGroup")
            .field("join_key", &self.join_key)
            .field("join_secret", &"***")
            .finish()
    }
}

impl FromStr for ComputeGroup {
    type Err = SliceLoopError;

    /// Parse `joinKey,joinSecret`
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(',') {
            Some((key, secret)) if !key.trim().is_empty() && !secret.trim().is_empty() => Ok(Self {
                join_key: key.trim().to_string(),
                join_secret: secret.trim().to_string(),
            }),
            _ => Err(SliceLoopError::invalid_input(
                "Compute group must be given as joinKey,joinSecret",
            )),
        }
    }
}

/// Lifecycle event published by a running job
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Job accepted for execution
    Accepted { id: Uuid },

    /// One slice finished
    Result { slice_index: usize, result: FinalResult },

    /// Job cancelled; remaining slices are skipped
    Cancel,

    /// A slice could not be executed
    Error { message: String },

    /// Diagnostic output
    Console { message: String },
}

/// Executes one slice
pub trait SliceExecutor: Send + Sync {
    fn execute(&self, request: WorkRequest) -> impl Future<Output = Result<FinalResult>> + Send;
}

/// Runs slices in this process on a shared runtime
pub struct LocalExecutor<B: Backend> {
    runtime: Arc<RuntimeContext<B>>,
    options: Arc<PipelineOptions>,
}

impl<B: Backend> LocalExecutor<B> {
    pub fn new(runtime: RuntimeContext<B>, options: PipelineOptions) -> Self {
        Self {
            runtime: Arc::new(runtime),
            options: Arc::new(options),
        }
    }

    /// The runtime shared by every executed slice
    pub fn runtime(&self) -> &RuntimeContext<B> {
        &self.runtime
    }
}

impl<B: Backend + 'static> SliceExecutor for LocalExecutor<B> {
    fn execute(&self, request: WorkRequest) -> impl Future<Output = Result<FinalResult>> + Send {
        let runtime = Arc::clone(&self.runtime);
        let options = Arc::clone(&self.options);

        async move {
            tokio::task::spawn_blocking(move || {
                let progress = |fraction: f64| debug!(progress = fraction, "Slice progress");
                run_work_function(&runtime, &request, &options, &progress)
            })
            .await
            .map_err(|e| SliceLoopError::Internal(format!("Slice task failed: {}", e)))
        }
    }
}

/// Cancels a job from another task
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    events: broadcast::Sender<JobEvent>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Job cancellation requested");
            let _ = self.events.send(JobEvent::Cancel);
        }
    }
}

/// A deployed inference job
pub struct Job {
    name: String,
    slices: Vec<Slice>,
    labels: Labels,
    invocation: Invocation,
    compute_group: Option<ComputeGroup>,
    events: broadcast::Sender<JobEvent>,
    cancelled: Arc<AtomicBool>,
}

impl Job {
    pub fn new(name: impl Into<String>, slices: Vec<Slice>, labels: Labels, invocation: Invocation) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            slices,
            labels,
            invocation,
            compute_group: None,
            events,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restrict the job to a compute group
    pub fn with_compute_group(mut self, group: Option<ComputeGroup>) -> Self {
        self.compute_group = group;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn compute_group(&self) -> Option<&ComputeGroup> {
        self.compute_group.as_ref()
    }

    /// Receive lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
            events: self.events.clone(),
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run every slice and collect the results in slice order.
    ///
    /// Aborted slices are results like any other. The job fails as a whole
    /// when a slice could not be executed at all or the job was cancelled.
    pub async fn exec<E: SliceExecutor>(&self, executor: &E) -> Result<Vec<FinalResult>> {
        let id = Uuid::new_v4();
        info!(
            job = %id,
            "Job accepted: {} ({} slices, compute group: {})",
            self.name,
            self.slices.len(),
            self.compute_group.as_ref().map_or("public", |g| g.join_key.as_str())
        );
        self.emit(JobEvent::Accepted { id });

        let mut results = Vec::with_capacity(self.slices.len());
        let mut failures = Vec::new();

        for (slice_index, slice) in self.slices.iter().enumerate() {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let request = self.invocation.request(slice.clone(), self.labels.clone());
            match executor.execute(request).await {
                Ok(result) => {
                    if let Some(reason) = result.abort_reason() {
                        warn!(slice = slice_index, "Slice aborted: {}", reason);
                        self.emit(JobEvent::Console {
                            message: format!("slice {}: {}", slice_index, reason),
                        });
                    }
                    self.emit(JobEvent::Result {
                        slice_index,
                        result: result.clone(),
                    });
                    results.push(result);
                }
                Err(e) => {
                    error!(slice = slice_index, "Slice failed: {}", e);
                    let message = format!("slice {}: {}", slice_index, e);
                    self.emit(JobEvent::Error {
                        message: message.clone(),
                    });
                    failures.push(message);
                }
            }
        }

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SliceLoopError::job(format!(
                "{} cancelled after {} of {} slices",
                self.name,
                results.len(),
                self.slices.len()
            )));
        }

        if !failures.is_empty() {
            return Err(SliceLoopError::job(format!(
                "{} of {} slices failed: {}",
                failures.len(),
                self.slices.len(),
                failures.join("; ")
            )));
        }

        info!(job = %id, "Job complete: {} results", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use sliceloop_common::MetricsRegistry;
    use sliceloop_proto::StageCode;
    use sliceloop_worker::testing::{FakeBackend, ScriptedSession};

    const PRE: &str = "def preprocess(data, input_names):\n    ...\n";
    const POST: &str = "def postprocess(outputs, labels, output_names):\n    ...\n";

    fn executor(backend: FakeBackend) -> LocalExecutor<FakeBackend> {
        LocalExecutor::new(
            RuntimeContext::with_metrics(backend, MetricsRegistry::new()),
            PipelineOptions::default(),
        )
    }

    fn echo_backend() -> FakeBackend {
        FakeBackend::new(ScriptedSession::echo(&["input"], &["output"]))
    }

    fn slices(sizes: &[usize]) -> Vec<Slice> {
        let mut n = 0;
        sizes
            .iter()
            .map(|size| {
                let mut slice = Slice::new();
                for _ in 0..*size {
                    slice.insert(format!("{:03}.png", n), STANDARD.encode([n as u8]));
                    n += 1;
                }
                slice
            })
            .collect()
    }

    fn bundled() -> Invocation {
        Invocation::Bundled(WorkArgs::bundled(STANDARD.encode(b"onnx"), PRE, POST, Vec::new()))
    }

    fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    struct FailingExecutor;

    impl SliceExecutor for FailingExecutor {
        fn execute(&self, _request: WorkRequest) -> impl Future<Output = Result<FinalResult>> + Send {
            async { Err(SliceLoopError::Internal("worker lost".to_string())) }
        }
    }

    #[test]
    fn test_compute_group_parse() {
        let group: ComputeGroup = "key-1, s3cret".parse().unwrap();
        assert_eq!(group.join_key, "key-1");
        assert_eq!(group.join_secret, "s3cret");
        assert!(!format!("{:?}", group).contains("s3cret"));

        for bad in ["", "key", "key,", ",secret"] {
            assert!(bad.parse::<ComputeGroup>().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_attached_invocation_request() {
        let module = AttachedModule {
            model: STANDARD.encode(b"onnx"),
            preprocess: STANDARD.encode(PRE),
            postprocess: STANDARD.encode(POST),
            packages: Vec::new(),
        };

        let request = Invocation::Attached(module.clone()).request(Slice::new(), Labels::default());

        assert_eq!(request.args, WorkArgs::default());
        assert_eq!(request.module, Some(module));
    }

    #[test]
    fn test_invocation_mode_follows_model_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("artifacts")).unwrap();
        for base in [dir.path().to_path_buf(), dir.path().join("artifacts")] {
            std::fs::write(base.join("m.onnx"), b"onnx").unwrap();
            std::fs::write(base.join("pre.py"), PRE).unwrap();
            std::fs::write(base.join("post.py"), POST).unwrap();
        }
        let mut descriptor: ModelDescriptor = serde_json::from_value(serde_json::json!({
            "name": "m", "model": "m.onnx", "preprocess": "pre.py", "postprocess": "post.py"
        }))
        .unwrap();

        let attached = Invocation::from_descriptor(&descriptor, dir.path(), None).unwrap();
        assert!(matches!(attached, Invocation::Attached(ref m) if m.model == STANDARD.encode(b"onnx")));

        descriptor.model_download = Some("artifacts".to_string());
        let bundled = Invocation::from_descriptor(&descriptor, dir.path(), None).unwrap();
        assert!(matches!(bundled, Invocation::Bundled(ref args) if args.preprocess.as_deref() == Some(PRE)));
    }

    #[tokio::test]
    async fn test_exec_collects_results_in_order() {
        let executor = executor(echo_backend());
        let job = Job::new("test job", slices(&[2, 1]), Labels::new("mnist", "p"), bundled());
        let mut rx = job.subscribe();

        let results = job.exec(&executor).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].items().unwrap().len(), 2);
        assert!(results[1].get("002.png").is_some());

        let events = drain(&mut rx);
        assert!(matches!(events[0], JobEvent::Accepted { .. }));
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Result { slice_index, .. } => Some(*slice_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_exec_reuses_runtime_across_slices() {
        let backend = echo_backend();
        let counters = backend.counters();
        let executor = executor(backend);
        let job = Job::new("test job", slices(&[1, 1, 1]), Labels::default(), bundled());

        job.exec(&executor).await.unwrap();

        assert_eq!(counters.session_builds(), 1);
        assert_eq!(counters.interpreter_starts(), 1);
        assert!(executor.runtime().is_session_ready());
    }

    #[tokio::test]
    async fn test_aborted_slice_is_a_result() {
        let executor = executor(echo_backend().fail_sessions(1));
        let job = Job::new("test job", slices(&[1, 1]), Labels::default(), bundled());
        let mut rx = job.subscribe();

        let results = job.exec(&executor).await.unwrap();

        assert_eq!(results[0].abort_reason().map(|r| r.code), Some(StageCode::Inference));
        assert!(!results[1].is_aborted());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, JobEvent::Console { message } if message.starts_with("slice 0"))));
    }

    #[tokio::test]
    async fn test_executor_failures_reject_the_job() {
        let job = Job::new("test job", slices(&[1, 1]), Labels::default(), bundled());
        let mut rx = job.subscribe();

        let err = job.exec(&FailingExecutor).await.unwrap_err();

        assert!(matches!(err, SliceLoopError::Job(_)));
        assert!(err.to_string().contains("2 of 2 slices failed"));
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, JobEvent::Error { .. }))
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_cancelled_job() {
        let executor = executor(echo_backend());
        let job = Job::new("test job", slices(&[1, 1]), Labels::default(), bundled());
        let mut rx = job.subscribe();

        job.cancel_handle().cancel();
        let err = job.exec(&executor).await.unwrap_err();

        assert!(err.to_string().contains("cancelled after 0 of 2 slices"));
        assert!(matches!(drain(&mut rx)[0], JobEvent::Cancel));
    }
}
