//! Progress reporting
//!
//! Progress is a fraction in `[0, 1]`. Checkpoints: 0 on entry, 0.1 once the
//! session is ready, 0.2 once the processors are loaded, then 0.8 spread
//! evenly over the items, ending at 1.0.

/// Fraction reported once the inference session is ready
pub const SESSION_READY: f64 = 0.1;

/// Fraction reported once the user processors are loaded
pub const PROCESSORS_READY: f64 = 0.2;

/// Receiver of progress updates
pub trait ProgressSink {
    fn report(&self, fraction: f64);
}

impl<F: Fn(f64)> ProgressSink for F {
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

/// Sink that drops every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}

/// Forwards checkpoints to a sink, clamped to `[0, 1]`, never decreasing and
/// never repeating a value
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    last: Option<f64>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink, last: None }
    }

    /// Report a checkpoint
    pub fn checkpoint(&mut self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };

        if let Some(last) = self.last {
            if fraction <= last {
                return;
            }
        }

        self.last = Some(fraction);
        self.sink.report(fraction);
    }

    /// Report that `done` of `total` items have finished
    pub fn item_done(&mut self, done: usize, total: usize) {
        if total == 0 {
            self.checkpoint(1.0);
            return;
        }
        let span = 1.0 - PROCESSORS_READY;
        self.checkpoint(PROCESSORS_READY + span * done as f64 / total as f64);
    }

    /// Report completion
    pub fn finish(&mut self) {
        self.checkpoint(1.0);
    }

    /// Last reported value
    pub fn last(&self) -> Option<f64> {
        self.last
    }
}
