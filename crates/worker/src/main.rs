//! SliceLoop Worker - Main Entry Point
//!
//! Reads work requests (JSON), runs each through the slice pipeline and writes
//! one result (JSON) per line to stdout. Requests come from the files named on
//! the command line, or one per line on stdin when no file is given. The
//! inference session and interpreter are built once and reused across all
//! requests handled by the process.

use anyhow::{Context, Result};
use sliceloop_common::SliceLoopConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SliceLoopConfig::from_env().context("Failed to load configuration")?;

    // Logs go to stderr, stdout carries results.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sliceloop_worker={}", config.observability.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting SliceLoop Worker");

    serve(config).await
}

#[cfg(all(feature = "onnx", feature = "python"))]
async fn serve(config: SliceLoopConfig) -> Result<()> {
    use sliceloop_common::METRICS;
    use sliceloop_proto::WorkRequest;
    use sliceloop_worker::native::NativeBackend;
    use sliceloop_worker::{reject_request, run_work_function, PipelineOptions, RuntimeContext};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tracing::debug;

    let runtime = Arc::new(RuntimeContext::new(NativeBackend::new(&config.worker)));
    let options = Arc::new(PipelineOptions::new(config.worker.clone()));

    let run = |request: WorkRequest| {
        let runtime = Arc::clone(&runtime);
        let options = Arc::clone(&options);
        tokio::task::spawn_blocking(move || {
            let progress = |fraction: f64| info!(progress = fraction, "Slice progress");
            run_work_function(&runtime, &request, &options, &progress)
        })
    };

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();

    if paths.is_empty() {
        info!("Reading work requests from stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let result = match serde_json::from_str::<WorkRequest>(&line) {
                Ok(request) => run(request).await?,
                Err(e) => reject_request(e),
            };
            println!("{}", serde_json::to_string(&result)?);
        }
    } else {
        for path in paths {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let result = match serde_json::from_str::<WorkRequest>(&content) {
                Ok(request) => run(request).await?,
                Err(e) => reject_request(format!("{}: {}", path.display(), e)),
            };
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    if config.observability.enable_metrics {
        debug!("Metrics:\n{}", METRICS.gather());
    }

    info!("Worker shutdown complete");
    Ok(())
}

#[cfg(not(all(feature = "onnx", feature = "python")))]
async fn serve(_config: SliceLoopConfig) -> Result<()> {
    anyhow::bail!("sliceloop-worker was built without the `onnx` and `python` features; no inference backend available")
}
