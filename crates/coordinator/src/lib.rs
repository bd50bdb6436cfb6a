//! SliceLoop Coordinator
//!
//! Deployment side of SliceLoop: slices an input directory, packages the
//! model, and runs a job over the slices through a [`SliceExecutor`].

pub mod artifacts;
pub mod job;
pub mod publish;
pub mod slicing;

pub use artifacts::{Artifact, ArtifactStore};
pub use job::{CancelHandle, ComputeGroup, Invocation, Job, JobEvent, LocalExecutor, SliceExecutor};
pub use publish::{build_module, load_descriptor, load_published, publish};
pub use slicing::slice_directory;
