//! Relay Validator - Entry Point
//!
//! Loads candidates, validates them under a global deadline and persists the
//! accepted relays. Ctrl+C or SIGTERM stops intake and saves what is done.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_validator::config::{Config, LogConfig};
use relay_validator::error::{Result, ScanError};
use relay_validator::repository::ResultAggregator;
use relay_validator::services::{
    write_snapshot, BatchReport, Pipeline, Scheduler, SchedulerHandle, SourceLoader, StreamWriter,
};

/// Relays answering faster than this are graded fast
const FAST_LATENCY_MS: u64 = 1500;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log, &config.log_directive());

    info!("Starting Relay Validator");

    let loader = SourceLoader::from_config(&config.source)?;
    let endpoints = match loader.load_file(&config.source.sources_file).await {
        Ok(endpoints) => endpoints,
        Err(ScanError::NothingToDo) => {
            warn!("No candidates loaded, nothing to do");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // Live append stream for interrupt resilience
    let (aggregator, stream_task) = match &config.output.stream_file {
        Some(path) => {
            let writer = StreamWriter::new(path);
            writer.reset().await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(writer.run(rx));
            (Arc::new(ResultAggregator::with_stream(tx)), Some(task))
        }
        None => (Arc::new(ResultAggregator::new()), None),
    };

    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let scheduler = Scheduler::new(pipeline, aggregator, config.scheduler.clone());

    let (handle, shutdown) = SchedulerHandle::new();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight candidates");
        handle.shutdown();
    });

    let report = scheduler.run(endpoints, shutdown).await;
    signal_task.abort();

    // Dropping the scheduler closes the stream channel.
    drop(scheduler);
    if let Some(task) = stream_task {
        match task.await {
            Ok(Ok(count)) => info!("Streamed {} proxies", count),
            Ok(Err(e)) => warn!("Stream writer failed: {}", e),
            Err(e) => warn!("Stream writer task ended abnormally: {}", e),
        }
    }

    summarize(&report);
    write_snapshot(&config.output.output_file, &report.results).await?;

    info!("Relay Validator stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig, default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn summarize(report: &BatchReport) {
    if let Some(reason) = report.stopped {
        warn!(
            pending = report.pending,
            "Batch stopped early ({:?}), results are partial", reason
        );
    }

    for (tags, group) in report.results.partition() {
        let fast = group
            .iter()
            .filter(|v| v.latency_ms < FAST_LATENCY_MS)
            .count();
        info!(
            partition = %tags,
            total = group.len(),
            fast,
            slow = group.len() - fast,
            "Partition summary"
        );
    }

    info!(
        accepted = report.accepted,
        rejected = report.rejected,
        failed = report.failed,
        "Valid proxies: {}",
        report.results.len()
    );
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
