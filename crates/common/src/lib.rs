//! SliceLoop common library
//!
//! This crate contains shared code used across SliceLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ProviderPreference, SliceLoopConfig};
pub use error::{Result, SliceLoopError};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
