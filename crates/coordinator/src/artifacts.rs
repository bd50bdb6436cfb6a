//! Model artifact store
//!
//! Serves the three artifacts named by a model descriptor from a directory:
//! the model weights (base64) and the two processing sources (text). Any
//! other name is rejected, so nothing outside the allow-list is ever read.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use memmap2::Mmap;
use sliceloop_common::{Result, SliceLoopError};
use sliceloop_proto::{ModelDescriptor, WorkArgs};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Artifact content as served to workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Binary content, base64 encoded
    Base64(String),

    /// Source text
    Text(String),
}

impl Artifact {
    /// The served body
    pub fn body(&self) -> &str {
        match self {
            Artifact::Base64(body) | Artifact::Text(body) => body,
        }
    }
}

/// Fetch-by-name access to a model's artifacts
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    descriptor: ModelDescriptor,
    root: PathBuf,
}

impl ArtifactStore {
    /// Serve `descriptor`'s artifacts from `root`
    pub fn new(descriptor: ModelDescriptor, root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            root: root.into(),
        }
    }

    /// Directory artifacts are read from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if `name` is one of the served artifacts
    pub fn is_allowed(&self, name: &str) -> bool {
        self.descriptor.artifact_names().contains(&name)
    }

    /// Fetch an artifact by name
    pub fn fetch(&self, name: &str) -> Result<Artifact> {
        if !self.is_allowed(name) {
            warn!("Request for invalid artifact: {}", name);
            return Err(SliceLoopError::not_found(name));
        }

        let path = self.root.join(name);
        if name == self.descriptor.model {
            let file = File::open(&path)
                .map_err(|e| SliceLoopError::model(format!("Failed to open {}: {}", path.display(), e)))?;
            // The file is only read while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            debug!("Serving model {} ({} bytes)", name, mmap.len());
            Ok(Artifact::Base64(STANDARD.encode(&mmap[..])))
        } else {
            let source = std::fs::read_to_string(&path)
                .map_err(|e| SliceLoopError::model(format!("Failed to read {}: {}", path.display(), e)))?;
            Ok(Artifact::Text(source))
        }
    }

    /// Fetch every artifact into bundled work arguments
    pub fn bundled_args(&self) -> Result<WorkArgs> {
        let model = self.fetch(&self.descriptor.model)?;
        let preprocess = self.fetch(&self.descriptor.preprocess)?;
        let postprocess = self.fetch(&self.descriptor.postprocess)?;

        Ok(WorkArgs::bundled(
            model.body(),
            preprocess.body(),
            postprocess.body(),
            self.descriptor.packages.clone(),
        ))
    }
}
