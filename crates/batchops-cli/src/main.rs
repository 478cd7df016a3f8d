//! CLI binary for running and resuming BatchOps pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use batchops_pipeline::{
    CancellationToken, EventEmitter, PipelineRunner, RunEvent, RunStore, StageExecutor,
    StageManifest,
};
use batchops_types::{Plan, RunId, RunOutcome};

#[derive(Parser)]
#[command(name = "batchops", version, about = "Resumable batch-pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding one subdirectory per run
    #[arg(long, global = true, default_value = "runs")]
    runs_dir: PathBuf,

    /// Stage manifest declaring the command behind each stage
    #[arg(long, global = true, default_value = "stages.json")]
    manifest: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run and execute it from the first stage
    Run {
        #[arg(long)]
        provider: String,

        #[arg(long)]
        pipeline: String,

        /// Snapshot date (YYYY-MM-DD)
        #[arg(long)]
        snapshot_date: String,

        /// Comma-separated stage list (default: every stage in the manifest)
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<String>>,
    },

    /// Resume a failed or interrupted run after its last recorded stage
    Resume {
        #[arg(long)]
        run_id: String,
    },

    /// Show a run's plan, state and audit trail
    Status {
        #[arg(long)]
        run_id: String,
    },

    /// List runs with their status
    List,

    /// Remove a lock left behind by a killed process
    Unlock {
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Run {
            provider,
            pipeline,
            snapshot_date,
            stages,
        } => {
            let code = cmd_run(&cli, provider, pipeline, snapshot_date, stages.clone()).await?;
            exit_with(code);
        }
        Commands::Resume { run_id } => {
            let code = cmd_resume(&cli, run_id).await?;
            exit_with(code);
        }
        Commands::Status { run_id } => cmd_status(&cli.runs_dir, run_id).await?,
        Commands::List => cmd_list(&cli.runs_dir).await?,
        Commands::Unlock { run_id } => cmd_unlock(&cli.runs_dir, run_id).await?,
    }

    Ok(())
}

fn exit_with(code: i32) {
    if code != 0 {
        std::process::exit(code);
    }
}

/// Build a runner from the manifest. Ctrl-C requests cancellation, which the
/// executor honors before the next stage.
async fn build_runner(cli: &Cli) -> anyhow::Result<(PipelineRunner, StageManifest)> {
    let manifest = StageManifest::load(&cli.manifest).await?;
    let registry = manifest.clone().into_registry();
    tracing::debug!(
        manifest = %cli.manifest.display(),
        stages = registry.len(),
        "Loaded stage manifest"
    );

    let cancel = CancellationToken::new();
    let events = EventEmitter::default();
    spawn_progress_printer(&events);

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; stopping after the current stage");
            ctrl_c.cancel();
        }
    });

    let executor = StageExecutor::new(Arc::new(registry))
        .with_events(events)
        .with_cancellation(cancel);
    Ok((
        PipelineRunner::new(RunStore::new(&cli.runs_dir), executor),
        manifest,
    ))
}

fn spawn_progress_printer(events: &EventEmitter) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                RunEvent::StageRebuilt { stage, duration_ms } => {
                    println!("  ~ {stage} (rebuilt, {duration_ms} ms)");
                }
                RunEvent::StageStarted { stage, index } => {
                    println!("  > [{}] {stage}", index + 1);
                }
                RunEvent::StageCompleted { stage, duration_ms } => {
                    println!("  ✓ {stage} ({duration_ms} ms)");
                }
                RunEvent::StageFailed { stage, error, .. } => {
                    println!("  ✗ {stage}: {error}");
                }
                _ => {}
            }
        }
    });
}

async fn cmd_run(
    cli: &Cli,
    provider: &str,
    pipeline: &str,
    snapshot_date: &str,
    stages: Option<Vec<String>>,
) -> anyhow::Result<i32> {
    let (runner, manifest) = build_runner(cli).await?;
    let stages = stages.unwrap_or_else(|| manifest.stage_ids());
    let plan = Plan::new(provider, pipeline, snapshot_date, stages)?;

    let run_id = runner.create(&plan).await?;
    println!("Run {run_id}");
    println!("Stages: {}", plan.stages.join(" -> "));

    let outcome = runner.run(&run_id).await?;
    Ok(report_outcome(&run_id, &outcome))
}

async fn cmd_resume(cli: &Cli, run_id: &str) -> anyhow::Result<i32> {
    let run_id = RunId::parse(run_id)?;
    let (runner, _) = build_runner(cli).await?;

    println!("Resuming run {run_id}");
    let outcome = runner.resume(&run_id).await?;
    Ok(report_outcome(&run_id, &outcome))
}

fn report_outcome(run_id: &RunId, outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed => {
            println!("\nRun {run_id} completed");
            0
        }
        RunOutcome::Failed { stage, reason } => {
            println!("\nRun {run_id} failed at stage '{stage}': {reason}");
            println!("Fix the cause, then: batchops resume --run-id {run_id}");
            1
        }
        RunOutcome::Cancelled { next_stage } => {
            println!("\nRun {run_id} cancelled before stage '{next_stage}'");
            println!("Continue with: batchops resume --run-id {run_id}");
            130
        }
    }
}

async fn cmd_status(runs_dir: &Path, run_id: &str) -> anyhow::Result<()> {
    let run_id = RunId::parse(run_id)?;
    let run = RunStore::new(runs_dir).open(&run_id).await?;
    let plan = run.checkpoint().load_plan().await?;
    let state = run.checkpoint().load_state().await?;

    println!("Run: {run_id}");
    println!("Provider: {}", plan.provider);
    println!("Pipeline: {}", plan.pipeline);
    println!("Snapshot date: {}", plan.snapshot_date);
    println!("Stages: {}", plan.stages.join(" -> "));
    println!(
        "State: {} at '{}' (updated {})",
        state.status,
        state.current_stage.as_deref().unwrap_or("-"),
        state.updated_at.to_rfc3339()
    );
    if run.dir().join(batchops_pipeline::run_store::LOCK_FILE).exists() {
        println!("Locked: yes");
    }

    println!("\nAudit trail:");
    for entry in run.audit().read_all().await? {
        println!(
            "  {} {:<12} {:<9} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.stage,
            entry.status,
            entry.message
        );
    }
    Ok(())
}

async fn cmd_list(runs_dir: &Path) -> anyhow::Result<()> {
    let store = RunStore::new(runs_dir);
    let ids = store.list().await?;
    if ids.is_empty() {
        println!("No runs under {}", store.root().display());
        return Ok(());
    }

    for run_id in ids {
        let run = store.open(&run_id).await?;
        match run.checkpoint().load_state().await {
            Ok(state) => println!(
                "{run_id}  {:<9} {}",
                state.status,
                state.current_stage.as_deref().unwrap_or("-")
            ),
            Err(e) => println!("{run_id}  unreadable ({e})"),
        }
    }
    Ok(())
}

async fn cmd_unlock(runs_dir: &Path, run_id: &str) -> anyhow::Result<()> {
    let run_id = RunId::parse(run_id)?;
    let run = RunStore::new(runs_dir).open(&run_id).await?;
    if run.force_unlock().await? {
        println!("Removed lock for run {run_id}");
    } else {
        println!("Run {run_id} was not locked");
    }
    Ok(())
}
