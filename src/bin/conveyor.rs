//! Conveyor CLI - resilient batch runs over a directory of input files.
//!
//! The binary wires a simple built-in copy worker into the orchestration
//! core. Real deployments embed the library and supply their own
//! [`Worker`]; everything else (admission, checkpointing, DLQ, breaker,
//! manifest) behaves identically.

use anyhow::Context;
use clap::Parser;
use conveyor_core::config::ConveyorConfig;
use conveyor_core::coordinator::{RunCoordinator, RunOptions};
use conveyor_core::logging::init_structured_logging;
use conveyor_core::pool::{WorkOutput, Worker, WorkerError, WorkerFactory};
use conveyor_core::resource::SysinfoProbe;
use conveyor_core::types::WorkItem;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

/// Conveyor: resilient batch orchestration for file-processing runs.
#[derive(Debug, Parser)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory of input files to process.
    input_dir: PathBuf,

    /// Directory receiving output artifacts.
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Configuration file (TOML). Environment variables with the
    /// CONVEYOR_ prefix override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding run state (manifest, checkpoint, DLQ, summary).
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Resume a crashed run from its checkpoint.
    #[arg(long)]
    resume: bool,

    /// Reprocess items even when the manifest says they are unchanged.
    #[arg(long)]
    force: bool,

    /// Report what would be dispatched without running anything.
    #[arg(long)]
    dry_run: bool,

    /// Drop manifest entries whose source files no longer exist.
    #[arg(long)]
    prune_deleted: bool,

    /// Treat a run with warnings as a partial failure.
    #[arg(long)]
    fail_on_warn: bool,

    /// Number of concurrent worker contexts (1 = deterministic sequential).
    #[arg(short = 'w', long, visible_alias = "workers", value_name = "N")]
    max_workers: Option<usize>,

    /// Quality-failure ratio above which dispatch halts.
    #[arg(long, value_name = "RATIO")]
    qa_failure_threshold: Option<f64>,
}

/// Built-in worker: copies each input into the output directory. Zero-byte
/// inputs are flagged as quality failures, which exercises the breaker on
/// systematically empty batches.
struct CopyWorker {
    output_dir: PathBuf,
}

#[async_trait::async_trait]
impl Worker for CopyWorker {
    async fn process(&self, item: &WorkItem) -> Result<WorkOutput, WorkerError> {
        let bytes = tokio::fs::read(&item.path)
            .await
            .map_err(|e| WorkerError::Transient(format!("read {}: {e}", item.path.display())))?;

        let output_path = self.output_dir.join(&item.id);
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::Transient(e.to_string()))?;
        }
        tokio::fs::write(&output_path, &bytes)
            .await
            .map_err(|e| WorkerError::Transient(format!("write {}: {e}", output_path.display())))?;

        Ok(WorkOutput {
            output_path: Some(output_path),
            quality_failure: bytes.is_empty(),
            warning: None,
        })
    }
}

struct CopyWorkerFactory {
    output_dir: PathBuf,
}

impl WorkerFactory for CopyWorkerFactory {
    fn create(&self) -> conveyor_core::Result<Box<dyn Worker>> {
        Ok(Box::new(CopyWorker {
            output_dir: self.output_dir.clone(),
        }))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_structured_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("conveyor: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config =
        ConveyorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(state_dir) = cli.state_dir {
        config.state.state_dir = state_dir;
    }
    if let Some(max_workers) = cli.max_workers {
        config.pool.max_workers = max_workers;
    }
    if let Some(threshold) = cli.qa_failure_threshold {
        config.breaker.threshold = threshold;
    }
    config.validate().context("validating configuration")?;

    let factory = Arc::new(CopyWorkerFactory {
        output_dir: cli.output_dir,
    });
    let coordinator = RunCoordinator::new(config, factory, Arc::new(SysinfoProbe::new()))
        .context("initializing coordinator")?
        .with_progress(Box::new(|result| {
            info!(
                item_id = %result.item_id,
                status = ?result.status,
                attempt = result.attempt,
                wall_time_ms = result.resources.wall_time_ms,
                "item completed"
            );
        }));

    let options = RunOptions {
        input_dir: cli.input_dir,
        resume: cli.resume,
        force: cli.force,
        dry_run: cli.dry_run,
        prune_deleted: cli.prune_deleted,
        fail_on_warn: cli.fail_on_warn,
    };

    let report = coordinator.run(&options).await.context("run failed")?;
    print_report(&report);
    Ok(report.outcome.exit_code())
}

fn print_report(report: &conveyor_core::coordinator::RunReport) {
    println!(
        "outcome: {:?} (processed {}, skipped {}, errors {}, dlq remaining {})",
        report.outcome,
        report.state.processed(),
        report.state.skipped,
        report.state.error,
        report.summary.dlq_remaining,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_alias_sets_max_workers() {
        let cli = Cli::try_parse_from(["conveyor", "in", "--workers", "8"]).unwrap();
        assert_eq!(cli.max_workers, Some(8));

        let cli = Cli::try_parse_from(["conveyor", "in", "--max-workers", "4"]).unwrap();
        assert_eq!(cli.max_workers, Some(4));

        let cli = Cli::try_parse_from(["conveyor", "in", "-w", "2"]).unwrap();
        assert_eq!(cli.max_workers, Some(2));
    }
}
