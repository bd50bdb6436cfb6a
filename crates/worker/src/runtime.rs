//! Per-process runtime cache
//!
//! The inference session and the interpreter are expensive to build, so each
//! is created at most once per worker process and reused by every slice that
//! process handles. A failed initialization leaves the slot empty; the next
//! slice retries. Packages already loaded into the interpreter are tracked and
//! not loaded again.

use crate::engine::{EngineError, InferenceSession, SessionOptions};
use crate::interpreter::{Interpreter, InterpreterError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sliceloop_common::{MetricsRegistry, ProviderPreference, METRICS};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Factory for the session and interpreter of a worker process
pub trait Backend: Send + Sync {
    type Session: InferenceSession;
    type Interpreter: Interpreter;

    /// Build an inference session from serialized model bytes
    fn create_session(&self, model: &[u8], options: &SessionOptions) -> Result<Self::Session, EngineError>;

    /// Start a fresh interpreter
    fn start_interpreter(&self) -> Result<Self::Interpreter, InterpreterError>;
}

/// Lazily initialized, process-wide runtime state
pub struct RuntimeContext<B: Backend> {
    backend: B,
    session: OnceCell<Mutex<B::Session>>,
    session_provider: OnceCell<ProviderPreference>,
    interpreter: OnceCell<Mutex<B::Interpreter>>,
    loaded_packages: Mutex<BTreeSet<String>>,
    metrics: MetricsRegistry,
}

impl<B: Backend> RuntimeContext<B> {
    /// Create an empty context reporting to the global metrics registry
    pub fn new(backend: B) -> Self {
        Self::with_metrics(backend, METRICS.clone())
    }

    /// Create an empty context with its own metrics registry
    pub fn with_metrics(backend: B, metrics: MetricsRegistry) -> Self {
        Self {
            backend,
            session: OnceCell::new(),
            session_provider: OnceCell::new(),
            interpreter: OnceCell::new(),
            loaded_packages: Mutex::new(BTreeSet::new()),
            metrics,
        }
    }

    /// The backend used to build the runtime
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Metrics this context reports to
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Return the process session, building it on first use.
    ///
    /// Once a session exists the model bytes and options are ignored; a
    /// different provider preference is logged and the existing session kept.
    pub fn ensure_session(
        &self,
        model: &[u8],
        options: &SessionOptions,
    ) -> Result<&Mutex<B::Session>, EngineError> {
        let session = self.session.get_or_try_init(|| {
            info!(provider = ?options.provider, "Creating inference session");
            let session = self.backend.create_session(model, options)?;
            self.metrics.runtime.session_initializations.inc();
            let _ = self.session_provider.set(session.provider());
            Ok::<_, EngineError>(Mutex::new(session))
        })?;

        let current = self.session_provider.get().copied().unwrap_or(options.provider);
        if current != options.provider {
            warn!(
                requested = ?options.provider,
                current = ?current,
                "Inference session already exists, ignoring provider preference"
            );
        }

        Ok(session)
    }

    /// Return the process interpreter, starting it on first use
    pub fn ensure_interpreter(&self) -> Result<&Mutex<B::Interpreter>, InterpreterError> {
        self.interpreter.get_or_try_init(|| {
            info!("Starting interpreter");
            let interpreter = self.backend.start_interpreter()?;
            self.metrics.runtime.interpreter_initializations.inc();
            Ok(Mutex::new(interpreter))
        })
    }

    /// Load the packages not loaded yet. Only packages that loaded
    /// successfully are recorded.
    pub fn ensure_packages(
        &self,
        interpreter: &mut B::Interpreter,
        packages: &[String],
    ) -> Result<(), InterpreterError> {
        let mut loaded = self.loaded_packages.lock();

        let mut missing: Vec<String> = Vec::new();
        for package in packages {
            if !loaded.contains(package) && !missing.contains(package) {
                missing.push(package.clone());
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        info!("Loading packages: {:?}", missing);
        interpreter.load_packages(&missing)?;

        self.metrics.runtime.packages_loaded.inc_by(missing.len() as u64);
        loaded.extend(missing);
        Ok(())
    }

    /// Provider of the session, once built
    pub fn session_provider(&self) -> Option<ProviderPreference> {
        self.session_provider.get().copied()
    }

    /// Check if the session has been built
    pub fn is_session_ready(&self) -> bool {
        self.session.get().is_some()
    }

    /// Check if the interpreter has been started
    pub fn is_interpreter_ready(&self) -> bool {
        self.interpreter.get().is_some()
    }

    /// Packages loaded so far
    pub fn loaded_packages(&self) -> Vec<String> {
        self.loaded_packages.lock().iter().cloned().collect()
    }
}
