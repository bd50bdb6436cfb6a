//! Metrics collection for SliceLoop
//!
//! This module provides Prometheus metrics for the slice pipeline.
//! Counters are bumped once per item or per slice, never inside user code.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use sliceloop_proto::StageCode;
use std::sync::Arc;

/// Metrics registry for SliceLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub pipeline: PipelineMetrics,
    pub runtime: RuntimeMetrics,
}

/// Slice and item level metrics
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Slices handed to the pipeline
    pub slices_total: IntCounter,

    /// Slices aborted before the item loop
    pub slices_aborted: IntCounter,

    /// Items that produced a payload
    pub items_succeeded: IntCounter,

    /// Items that produced an error record, by stage code
    pub items_failed: IntCounterVec,

    /// Preprocess duration
    pub preprocess_duration: Histogram,

    /// Inference duration
    pub inference_duration: Histogram,

    /// Postprocess duration
    pub postprocess_duration: Histogram,
}

/// Runtime cache metrics
#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    /// Inference sessions built (at most one per process)
    pub session_initializations: IntCounter,

    /// Interpreters started (at most one per process)
    pub interpreter_initializations: IntCounter,

    /// Interpreter packages loaded
    pub packages_loaded: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn stage_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Metric names and options are static, construction cannot fail.
        let slices_total = IntCounter::new(
            "pipeline_slices_total",
            "Total number of slices handed to the pipeline"
        ).unwrap();

        let slices_aborted = IntCounter::new(
            "pipeline_slices_aborted_total",
            "Slices aborted before any item was processed"
        ).unwrap();

        let items_succeeded = IntCounter::new(
            "pipeline_items_succeeded_total",
            "Items that produced a postprocessed payload"
        ).unwrap();

        let items_failed = IntCounterVec::new(
            Opts::new("pipeline_items_failed_total", "Items that produced an error record"),
            &["stage"],
        ).unwrap();

        let preprocess_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_preprocess_duration_seconds",
                "User preprocess duration in seconds"
            ).buckets(stage_buckets())
        ).unwrap();

        let inference_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_inference_duration_seconds",
                "Inference session run duration in seconds"
            ).buckets(stage_buckets())
        ).unwrap();

        let postprocess_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_postprocess_duration_seconds",
                "User postprocess duration in seconds"
            ).buckets(stage_buckets())
        ).unwrap();

        let session_initializations = IntCounter::new(
            "runtime_session_initializations_total",
            "Inference sessions created"
        ).unwrap();

        let interpreter_initializations = IntCounter::new(
            "runtime_interpreter_initializations_total",
            "Embedded interpreters started"
        ).unwrap();

        let packages_loaded = IntCounter::new(
            "runtime_packages_loaded_total",
            "Interpreter packages loaded"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(slices_total.clone())).unwrap();
        registry.register(Box::new(slices_aborted.clone())).unwrap();
        registry.register(Box::new(items_succeeded.clone())).unwrap();
        registry.register(Box::new(items_failed.clone())).unwrap();
        registry.register(Box::new(preprocess_duration.clone())).unwrap();
        registry.register(Box::new(inference_duration.clone())).unwrap();
        registry.register(Box::new(postprocess_duration.clone())).unwrap();

        registry.register(Box::new(session_initializations.clone())).unwrap();
        registry.register(Box::new(interpreter_initializations.clone())).unwrap();
        registry.register(Box::new(packages_loaded.clone())).unwrap();

        let pipeline = PipelineMetrics {
            slices_total,
            slices_aborted,
            items_succeeded,
            items_failed,
            preprocess_duration,
            inference_duration,
            postprocess_duration,
        };

        let runtime = RuntimeMetrics {
            session_initializations,
            interpreter_initializations,
            packages_loaded,
        };

        MetricsRegistry {
            registry,
            pipeline,
            runtime,
        }
    }

    /// Record an item-level failure
    pub fn record_item_failure(&self, code: StageCode) {
        self.pipeline
            .items_failed
            .with_label_values(&[code.as_str()])
            .inc();
    }

    /// Number of item failures recorded for a stage
    pub fn item_failures(&self, code: StageCode) -> u64 {
        self.pipeline
            .items_failed
            .with_label_values(&[code.as_str()])
            .get()
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
