//! Model package resolution
//!
//! A work function receives its model package in one of two ways: bundled in
//! the invocation arguments (model base64, sources as plain text) or as an
//! attached module where every field is base64 encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sliceloop_proto::{AttachedModule, WorkArgs};
use thiserror::Error;

/// Package resolution errors; all of them abort the slice
#[derive(Error, Debug)]
pub enum PackageError {
    /// Neither bundled arguments nor an attached module were supplied
    #[error("no model package: the invocation carries no model and no attached module")]
    Missing,

    /// A bundled invocation is missing one of its fields
    #[error("bundled model package is missing `{0}`")]
    Incomplete(&'static str),

    /// A field is not valid base64
    #[error("`{field}` is not valid base64: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    /// A decoded source is not valid UTF-8
    #[error("`{0}` is not valid UTF-8")]
    Utf8(&'static str),
}

/// Decoded model package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPackage {
    /// Serialized model
    pub model: Vec<u8>,

    /// Preprocess module source
    pub preprocess: String,

    /// Postprocess module source
    pub postprocess: String,

    /// Interpreter packages the user code needs
    pub packages: Vec<String>,
}

fn decode(field: &'static str, encoded: &str) -> Result<Vec<u8>, PackageError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|source| PackageError::Decode { field, source })
}

fn decode_text(field: &'static str, encoded: &str) -> Result<String, PackageError> {
    String::from_utf8(decode(field, encoded)?).map_err(|_| PackageError::Utf8(field))
}

impl ModelPackage {
    /// Resolve the package. Bundled arguments win when they carry a model;
    /// otherwise the attached module is used.
    pub fn resolve(args: &WorkArgs, attached: Option<&AttachedModule>) -> Result<Self, PackageError> {
        if let Some(model) = &args.model {
            return Ok(Self {
                model: decode("model", model)?,
                preprocess: args.preprocess.clone().ok_or(PackageError::Incomplete("preprocess"))?,
                postprocess: args.postprocess.clone().ok_or(PackageError::Incomplete("postprocess"))?,
                packages: args.packages.clone().unwrap_or_default(),
            });
        }

        let module = attached.ok_or(PackageError::Missing)?;
        Ok(Self {
            model: decode("model", &module.model)?,
            preprocess: decode_text("preprocess", &module.preprocess)?,
            postprocess: decode_text("postprocess", &module.postprocess)?,
            packages: module.packages.clone(),
        })
    }

    /// Encode as an attached module
    pub fn to_attached(&self) -> AttachedModule {
        AttachedModule {
            model: STANDARD.encode(&self.model),
            preprocess: STANDARD.encode(self.preprocess.as_bytes()),
            postprocess: STANDARD.encode(self.postprocess.as_bytes()),
            packages: self.packages.clone(),
        }
    }

    /// Encode as bundled arguments
    pub fn to_work_args(&self) -> WorkArgs {
        WorkArgs::bundled(
            STANDARD.encode(&self.model),
            self.preprocess.clone(),
            self.postprocess.clone(),
            self.packages.clone(),
        )
    }
}
