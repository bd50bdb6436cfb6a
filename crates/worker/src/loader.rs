//! User-code loader
//!
//! Installs the user's preprocess and postprocess modules into the
//! interpreter and resolves one entry point from each.

use crate::interpreter::{Interpreter, InterpreterError};
use thiserror::Error;
use tracing::debug;

/// Module name the preprocess source is installed under
pub const PREPROCESS_MODULE: &str = "preprocess";

/// Module name the postprocess source is installed under
pub const POSTPROCESS_MODULE: &str = "postprocess";

/// Loader errors; all of them abort the slice
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Writing, importing or reading the module failed
    #[error("{module}: {source}")]
    Interpreter {
        module: String,
        #[source]
        source: InterpreterError,
    },

    /// No exported name matches the stage
    #[error("module {module} exposes no {stage} function")]
    NoEntryPoint { module: String, stage: String },

    /// More than one exported name matches the stage
    #[error("module {module} exposes several {stage} functions: {}", candidates.join(", "))]
    AmbiguousEntryPoint {
        module: String,
        stage: String,
        candidates: Vec<String>,
    },
}

impl LoaderError {
    /// Single-line summary suitable for an error record
    pub fn summary(&self) -> String {
        match self {
            LoaderError::Interpreter { source, .. } => source.summary(),
            other => other.to_string(),
        }
    }
}

/// Resolved user callables
#[derive(Debug, Clone)]
pub struct Processors<C> {
    pub preprocess: C,
    pub postprocess: C,
}

/// Pick the entry point for `stage` among a module's exported names.
///
/// An exported name equal to the stage (ignoring case) wins outright.
/// Otherwise the public names containing the stage (ignoring case) are the
/// candidates, and exactly one must remain.
pub fn resolve_entry_point(module: &str, stage: &str, names: &[String]) -> Result<String, LoaderError> {
    let stage_lower = stage.to_lowercase();

    let exact: Vec<&String> = names.iter().filter(|n| n.to_lowercase() == stage_lower).collect();
    if exact.len() == 1 {
        return Ok(exact[0].clone());
    }

    let candidates: Vec<String> = names
        .iter()
        .filter(|n| !n.starts_with('_') && n.to_lowercase().contains(&stage_lower))
        .cloned()
        .collect();

    match candidates.len() {
        0 => Err(LoaderError::NoEntryPoint {
            module: module.to_string(),
            stage: stage.to_string(),
        }),
        1 => Ok(candidates[0].clone()),
        _ => Err(LoaderError::AmbiguousEntryPoint {
            module: module.to_string(),
            stage: stage.to_string(),
            candidates,
        }),
    }
}

fn load_one<I: Interpreter>(interpreter: &mut I, module: &str, source: &str) -> Result<I::Callable, LoaderError> {
    let wrap = |source: InterpreterError| LoaderError::Interpreter {
        module: module.to_string(),
        source,
    };

    let names = interpreter.install_module(module, source).map_err(wrap)?;
    let entry = resolve_entry_point(module, module, &names)?;
    debug!("Resolved {}.{}", module, entry);

    interpreter.lookup(module, &entry).map_err(wrap)
}

/// Install both modules (replacing any previous versions) and resolve their
/// entry points
pub fn load_processors<I: Interpreter>(
    interpreter: &mut I,
    preprocess_source: &str,
    postprocess_source: &str,
) -> Result<Processors<I::Callable>, LoaderError> {
    let preprocess = load_one(interpreter, PREPROCESS_MODULE, preprocess_source)?;
    let postprocess = load_one(interpreter, POSTPROCESS_MODULE, postprocess_source)?;

    Ok(Processors { preprocess, postprocess })
}
