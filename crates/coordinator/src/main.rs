//! SliceLoop Coordinator - Main Entry Point
//!
//! `sliceloop deploy` slices an input directory and runs an inference job
//! over it; `sliceloop publish` packages a model for attached-module jobs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sliceloop_common::SliceLoopConfig;
use sliceloop_coordinator::{slice_directory, ComputeGroup, Invocation, Job, JobEvent, SliceExecutor};
use sliceloop_proto::{FinalResult, Labels};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sliceloop", version, about = "Distributed slice inference")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a model over every file of a directory
    Deploy {
        /// Model descriptor (model.json)
        model: PathBuf,

        /// Directory of input files
        input: PathBuf,

        /// Files per slice
        #[arg(long)]
        batch: Option<usize>,

        /// Write collected results here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Compute group as joinKey,joinSecret
        #[arg(long)]
        compute_group: Option<String>,

        /// Prefer an accelerated execution provider
        #[arg(long)]
        accelerated: bool,

        /// Forward the debug flag to user code
        #[arg(long)]
        debug: bool,
    },

    /// Package a model as an attached module
    Publish {
        /// Model descriptor (model.json)
        model: PathBuf,

        /// Output directory
        #[arg(long, default_value = "published")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = SliceLoopConfig::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sliceloop_coordinator={}", config.observability.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Deploy {
            model,
            input,
            batch,
            output,
            compute_group,
            accelerated,
            debug,
        } => {
            let batch_size = batch.unwrap_or(config.coordinator.batch_size);
            let output = output.or_else(|| config.coordinator.output.clone());
            let compute_group = compute_group
                .or_else(|| config.coordinator.compute_group.clone())
                .map(|group| group.parse::<ComputeGroup>())
                .transpose()?;

            let (descriptor, base) = sliceloop_coordinator::load_descriptor(&model)?;
            let invocation =
                Invocation::from_descriptor(&descriptor, &base, config.coordinator.artifact_dir.as_deref())?;
            let slices = slice_directory(&input, batch_size)?;

            let mut labels = Labels::new(descriptor.name.clone(), Uuid::new_v4().to_string());
            labels.accelerated = accelerated;
            labels.debug = debug;

            let job = Job::new(
                format!("{}: {}", config.coordinator.job_name_prefix, descriptor.name),
                slices,
                labels,
                invocation,
            )
            .with_compute_group(compute_group);

            deploy(job, &config, output.as_deref()).await
        }
        Command::Publish { model, out } => {
            let (descriptor, base) = sliceloop_coordinator::load_descriptor(&model)?;
            let package = sliceloop_coordinator::publish(&descriptor, &base, &out)?;
            info!("Package descriptor written to {}", package.display());
            Ok(())
        }
    }
}

#[cfg(feature = "local")]
async fn deploy(job: Job, config: &SliceLoopConfig, output: Option<&Path>) -> Result<()> {
    use sliceloop_coordinator::LocalExecutor;
    use sliceloop_worker::native::NativeBackend;
    use sliceloop_worker::{PipelineOptions, RuntimeContext};

    let executor = LocalExecutor::new(
        RuntimeContext::new(NativeBackend::new(&config.worker)),
        PipelineOptions::new(config.worker.clone()),
    );
    run(job, &executor, output).await
}

#[cfg(not(feature = "local"))]
async fn deploy(_job: Job, _config: &SliceLoopConfig, _output: Option<&Path>) -> Result<()> {
    anyhow::bail!("sliceloop was built without the `local` feature; no slice executor available")
}

/// Execute the job, logging its events, and write the collected results
#[cfg_attr(not(feature = "local"), allow(dead_code))]
async fn run<E: SliceExecutor>(job: Job, executor: &E, output: Option<&Path>) -> Result<()> {
    let mut events = job.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::Accepted { id }) => info!("Job accepted: {}", id),
                Ok(JobEvent::Result { slice_index, result }) => log_result(slice_index, &result),
                Ok(JobEvent::Cancel) => warn!("Job cancelled"),
                Ok(JobEvent::Error { message }) => error!("Job error: {}", message),
                Ok(JobEvent::Console { message }) => info!("{}", message),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} job events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = job.cancel_handle();
    let results = tokio::select! {
        results = job.exec(executor) => results,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            cancel.cancel();
            Err(sliceloop_common::SliceLoopError::job("interrupted"))
        }
    };

    // Closes the event channel.
    drop(cancel);
    drop(job);
    let _ = printer.await;

    let results = results?;
    let json = serde_json::to_string_pretty(&results)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Results written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

fn log_result(slice_index: usize, result: &FinalResult) {
    match result {
        FinalResult::Aborted(record) => warn!(slice = slice_index, "Slice aborted: {}", record),
        FinalResult::Completed(items) => info!(
            slice = slice_index,
            "Slice complete: {} items, {} errors",
            items.len(),
            result.error_count()
        ),
    }
}
