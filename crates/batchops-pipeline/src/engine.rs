//! Stage executor (the core run loop) and the [`PipelineRunner`] facade.
//!
//! A pass walks `Plan.stages` from a start index.  For each stage it appends
//! a `started` audit entry, checkpoints `{stage, running}`, invokes the
//! handler, and then records `completed` or `failed`.  A domain failure halts
//! the pass and is returned as [`RunOutcome::Failed`]; a hard failure is
//! recorded the same way and then returned as the error.

use std::sync::Arc;
use std::time::Instant;

use batchops_types::{
    BatchOpsError, Context, LogStatus, Plan, Result, RunId, RunOutcome, RunState, StageOutcome,
};

use crate::cancellation::CancellationToken;
use crate::events::{EventEmitter, RunEvent};
use crate::handler::{StageInvocation, StageRegistry};
use crate::run_store::{RunHandle, RunLock, RunStore};
use crate::summary;

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

/// Drives one pass through a plan's stages.
pub struct StageExecutor {
    registry: Arc<StageRegistry>,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl StageExecutor {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            registry,
            events: EventEmitter::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Execute every stage at index `>= start_index` in plan order.
    ///
    /// The caller must hold the run's lock; `_lock` makes that a compile-time
    /// requirement.
    pub async fn execute_from(
        &self,
        run: &RunHandle,
        _lock: &RunLock,
        plan: &Plan,
        start_index: usize,
        context: Context,
    ) -> Result<RunOutcome> {
        self.registry.validate_plan(plan)?;
        let run_id = run.run_id();
        let total = plan.stages.len();

        tracing::info!(run_id = %run_id, start_index, stages = total, "Starting executor pass");
        self.events.emit(RunEvent::PassStarted {
            run_id: run_id.to_string(),
            start_index,
            stage_count: total,
        });

        for (index, stage) in plan.stages.iter().enumerate().skip(start_index) {
            if self.cancel.is_cancelled() {
                tracing::warn!(run_id = %run_id, next_stage = %stage, "Run cancelled at stage boundary");
                self.events.emit(RunEvent::RunCancelled {
                    run_id: run_id.to_string(),
                    next_stage: stage.clone(),
                });
                return Ok(RunOutcome::Cancelled {
                    next_stage: stage.clone(),
                });
            }

            let registered = self.registry.get(stage)?;

            // The log must hold a `started` entry for whatever the checkpoint
            // claims is current.
            run.audit()
                .append(stage, LogStatus::Started, format!("stage {} of {total}", index + 1))
                .await
                .inspect_err(|e| {
                    tracing::error!(run_id = %run_id, stage = %stage, error = %e, "Could not log stage start");
                })?;
            if let Err(e) = self.save_state(run, &RunState::running(stage)).await {
                return Err(self.record_bookkeeping_failure(run, stage, e).await);
            }

            tracing::info!(run_id = %run_id, stage = %stage, index, "Stage started");
            self.events.emit(RunEvent::StageStarted {
                stage: stage.clone(),
                index,
            });

            let invocation = StageInvocation {
                run_id,
                run_dir: run.dir(),
                plan,
                stage,
                rebuild: false,
            };
            let started = Instant::now();

            match registered.invoke(&invocation, &context).await {
                Ok(StageOutcome::Success { updates, notes }) => {
                    context.apply_updates(updates).await;
                    if let Err(e) = run.audit().append(stage, LogStatus::Completed, notes).await {
                        return Err(self.record_bookkeeping_failure(run, stage, e).await);
                    }
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(run_id = %run_id, stage = %stage, duration_ms, "Stage completed");
                    self.events.emit(RunEvent::StageCompleted {
                        stage: stage.clone(),
                        duration_ms,
                    });
                }
                Ok(StageOutcome::DomainFailure { reason }) => {
                    tracing::warn!(run_id = %run_id, stage = %stage, reason = %reason, "Stage reported a domain failure");
                    self.record_failure(run, stage, &reason, true).await?;
                    return Ok(RunOutcome::Failed {
                        stage: stage.clone(),
                        reason,
                    });
                }
                Err(err) => {
                    tracing::error!(run_id = %run_id, stage = %stage, error = %err, "Stage failed");
                    self.record_failure(run, stage, &err.to_string(), false)
                        .await
                        .inspect_err(|persist_err| {
                            tracing::error!(
                                run_id = %run_id,
                                stage = %stage,
                                error = %persist_err,
                                "Could not record stage failure"
                            );
                        })?;
                    return Err(err);
                }
            }
        }

        let last = plan
            .last_stage()
            .ok_or_else(|| BatchOpsError::InvalidPlan("plan has no stages".into()))?;
        self.save_state(run, &RunState::completed(last)).await?;
        tracing::info!(run_id = %run_id, "Run completed");
        self.events.emit(RunEvent::RunCompleted {
            run_id: run_id.to_string(),
        });

        match summary::generate(run).await {
            Ok(path) => tracing::info!(run_id = %run_id, path = %path.display(), "Run summary written"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Could not write run summary"),
        }

        Ok(RunOutcome::Completed)
    }

    /// Append a `failed` entry and checkpoint `{stage, failed}`.
    pub(crate) async fn record_failure(
        &self,
        run: &RunHandle,
        stage: &str,
        message: &str,
        domain: bool,
    ) -> Result<()> {
        self.record_failure_at(run, stage, stage, message, domain).await
    }

    /// Record that `failed_stage` failed while the checkpoint names
    /// `checkpointed`. The `failed` entry and the `{checkpointed, failed}`
    /// state both stay on the checkpointed stage, so the checkpoint never
    /// moves backwards.
    pub(crate) async fn record_failure_at(
        &self,
        run: &RunHandle,
        checkpointed: &str,
        failed_stage: &str,
        message: &str,
        domain: bool,
    ) -> Result<()> {
        run.audit()
            .append(checkpointed, LogStatus::Failed, message)
            .await?;
        self.save_state(run, &RunState::failed(checkpointed)).await?;
        self.events.emit(RunEvent::StageFailed {
            stage: failed_stage.to_string(),
            error: message.to_string(),
            domain,
        });
        self.events.emit(RunEvent::RunFailed {
            run_id: run.run_id().to_string(),
            stage: checkpointed.to_string(),
        });
        Ok(())
    }

    /// Progress for `stage` could not be persisted. Record the failure as far
    /// as the disk allows and hand back the original error.
    async fn record_bookkeeping_failure(
        &self,
        run: &RunHandle,
        stage: &str,
        err: BatchOpsError,
    ) -> BatchOpsError {
        let run_id = run.run_id();
        tracing::error!(run_id = %run_id, stage = %stage, error = %err, "Could not persist stage progress");
        let message = format!("could not persist progress: {err}");

        if let Err(e) = run.audit().append(stage, LogStatus::Failed, &message).await {
            tracing::error!(run_id = %run_id, stage = %stage, error = %e, "Could not log stage failure");
        }
        if let Err(e) = self.save_state(run, &RunState::failed(stage)).await {
            tracing::error!(run_id = %run_id, stage = %stage, error = %e, "Could not checkpoint stage failure");
        }
        self.events.emit(RunEvent::StageFailed {
            stage: stage.to_string(),
            error: message,
            domain: false,
        });
        err
    }

    async fn save_state(&self, run: &RunHandle, state: &RunState) -> Result<()> {
        run.checkpoint().save_state(state).await?;
        self.events.emit(RunEvent::CheckpointSaved {
            stage: state.current_stage.clone().unwrap_or_default(),
            status: state.status.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Entry point for creating, running, and resuming runs.
pub struct PipelineRunner {
    pub(crate) store: RunStore,
    pub(crate) executor: StageExecutor,
}

impl PipelineRunner {
    pub fn new(store: RunStore, executor: StageExecutor) -> Self {
        Self { store, executor }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Create a run for `plan`. The plan is checked against the registry
    /// first, so a plan naming an unknown stage never gets a run directory.
    pub async fn create(&self, plan: &Plan) -> Result<RunId> {
        self.executor.registry().validate_plan(plan)?;
        let (run, _) = self.store.create_run(plan).await?;
        Ok(run.run_id().clone())
    }

    /// Execute a freshly created run from its first stage.
    pub async fn run(&self, run_id: &RunId) -> Result<RunOutcome> {
        let run = self.store.open(run_id).await?;
        let lock = run.lock()?;
        let plan = run.checkpoint().load_plan().await?;
        let state = run.checkpoint().load_state().await?;
        if !state.is_fresh() {
            return Err(BatchOpsError::InvalidResumeState {
                run_id: run_id.to_string(),
                message: format!(
                    "run has already started (stage '{}', status {}); resume it instead",
                    state.current_stage.unwrap_or_default(),
                    state.status
                ),
            });
        }
        self.executor
            .execute_from(&run, &lock, &plan, 0, Context::new())
            .await
    }

    /// Create a run and execute it. Returns the new run's id with the outcome.
    pub async fn start(&self, plan: &Plan) -> Result<(RunId, RunOutcome)> {
        let run_id = self.create(plan).await?;
        let outcome = self.run(&run_id).await?;
        Ok((run_id, outcome))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{StageDefinition, StageHandler};
    use async_trait::async_trait;
    use batchops_types::{LogEntry, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkHandler {
        key: &'static str,
    }

    #[async_trait]
    impl StageHandler for OkHandler {
        async fn execute(
            &self,
            _invocation: &StageInvocation<'_>,
            _context: &Context,
        ) -> Result<StageOutcome> {
            Ok(StageOutcome::success("ok").with_update(self.key, serde_json::json!(true)))
        }
    }

    struct DomainFail;

    #[async_trait]
    impl StageHandler for DomainFail {
        async fn execute(
            &self,
            _invocation: &StageInvocation<'_>,
            _context: &Context,
        ) -> Result<StageOutcome> {
            Ok(StageOutcome::domain_failure("dq status FAIL"))
        }
    }

    struct HardFail;

    #[async_trait]
    impl StageHandler for HardFail {
        async fn execute(
            &self,
            invocation: &StageInvocation<'_>,
            _context: &Context,
        ) -> Result<StageOutcome> {
            Err(BatchOpsError::HandlerError {
                stage: invocation.stage.to_string(),
                message: "database unavailable".into(),
            })
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageHandler for Counting {
        async fn execute(
            &self,
            _invocation: &StageInvocation<'_>,
            _context: &Context,
        ) -> Result<StageOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutcome::success("counted"))
        }
    }

    fn plan(stages: &[&str]) -> Plan {
        Plan::new(
            "acme",
            "propensity",
            "2024-01-31",
            stages.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    fn runner(root: &std::path::Path, registry: StageRegistry) -> PipelineRunner {
        PipelineRunner::new(
            RunStore::new(root),
            StageExecutor::new(Arc::new(registry)),
        )
    }

    fn pairs(entries: &[LogEntry]) -> Vec<(String, LogStatus)> {
        entries.iter().map(|e| (e.stage.clone(), e.status)).collect()
    }

    #[tokio::test]
    async fn linear_run_completes_and_logs_pairs_in_order() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        reg.register(
            StageDefinition::new("import").requires(["datasets"]),
            OkHandler { key: "imported" },
        );
        let runner = runner(root.path(), reg);

        let (run_id, outcome) = runner.start(&plan(&["ingestion", "import"])).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let run = runner.store().open(&run_id).await.unwrap();
        let state = run.checkpoint().load_state().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.current_stage.as_deref(), Some("import"));

        let entries = run.audit().read_all().await.unwrap();
        assert_eq!(
            pairs(&entries),
            vec![
                ("ingestion".to_string(), LogStatus::Started),
                ("ingestion".to_string(), LogStatus::Completed),
                ("import".to_string(), LogStatus::Started),
                ("import".to_string(), LogStatus::Completed),
            ]
        );
        assert!(run.dir().join("summary.md").exists());
        assert!(!run.dir().join("run.lock").exists());
    }

    #[tokio::test]
    async fn domain_failure_halts_and_marks_failed() {
        let root = tempfile::tempdir().unwrap();
        let later = Arc::new(AtomicUsize::new(0));
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        reg.register(StageDefinition::new("validation"), DomainFail);
        reg.register(StageDefinition::new("import"), Counting { calls: later.clone() });
        let runner = runner(root.path(), reg);

        let (run_id, outcome) = runner
            .start(&plan(&["ingestion", "validation", "import"]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                stage: "validation".into(),
                reason: "dq status FAIL".into()
            }
        );
        assert_eq!(later.load(Ordering::SeqCst), 0);

        let run = runner.store().open(&run_id).await.unwrap();
        let state = run.checkpoint().load_state().await.unwrap();
        assert_eq!(state.current_stage.as_deref(), Some("validation"));
        assert_eq!(state.status, RunStatus::Failed);

        let entries = run.audit().read_all().await.unwrap();
        assert!(entries.iter().all(|e| e.stage != "import"));
        assert_eq!(entries.last().unwrap().message, "dq status FAIL");
        assert!(!run.dir().join("summary.md").exists());
    }

    #[tokio::test]
    async fn hard_failure_is_recorded_then_propagated() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        reg.register(StageDefinition::new("import"), HardFail);
        let runner = runner(root.path(), reg);

        let run_id = runner.create(&plan(&["ingestion", "import"])).await.unwrap();
        let err = runner.run(&run_id).await.unwrap_err();
        assert!(err.to_string().contains("database unavailable"));

        let run = runner.store().open(&run_id).await.unwrap();
        let state = run.checkpoint().load_state().await.unwrap();
        assert_eq!(state, RunState { updated_at: state.updated_at, ..RunState::failed("import") });
        let entries = run.audit().read_all().await.unwrap();
        assert_eq!(
            pairs(&entries).last().unwrap(),
            &("import".to_string(), LogStatus::Failed)
        );
        assert!(!run.dir().join("run.lock").exists());
    }

    #[tokio::test]
    async fn missing_required_context_is_a_hard_failure() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = StageRegistry::new();
        reg.register(
            StageDefinition::new("import").requires(["datasets"]),
            OkHandler { key: "imported" },
        );
        let runner = runner(root.path(), reg);

        let run_id = runner.create(&plan(&["import"])).await.unwrap();
        let err = runner.run(&run_id).await.unwrap_err();
        assert!(matches!(err, BatchOpsError::MissingContext { .. }), "got {err:?}");

        let run = runner.store().open(&run_id).await.unwrap();
        assert_eq!(
            run.checkpoint().load_state().await.unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_stage_creates_no_run() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        let runner = runner(root.path(), reg);

        let err = runner.start(&plan(&["ingestion", "score"])).await.unwrap_err();
        assert!(matches!(err, BatchOpsError::UnknownStage { ref stage } if stage == "score"));
        assert!(runner.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_refuses_a_run_that_already_started() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        let runner = runner(root.path(), reg);

        let (run_id, _) = runner.start(&plan(&["ingestion"])).await.unwrap();
        let err = runner.run(&run_id).await.unwrap_err();
        assert!(matches!(err, BatchOpsError::InvalidResumeState { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_stops_at_stage_boundary() {
        let root = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        struct CancelAfter {
            cancel: CancellationToken,
        }

        #[async_trait]
        impl StageHandler for CancelAfter {
            async fn execute(
                &self,
                _invocation: &StageInvocation<'_>,
                _context: &Context,
            ) -> Result<StageOutcome> {
                self.cancel.cancel();
                Ok(StageOutcome::success("finished despite cancellation"))
            }
        }

        let later = Arc::new(AtomicUsize::new(0));
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), CancelAfter { cancel: cancel.clone() });
        reg.register(StageDefinition::new("validation"), Counting { calls: later.clone() });
        let runner = PipelineRunner::new(
            RunStore::new(root.path()),
            StageExecutor::new(Arc::new(reg)).with_cancellation(cancel),
        );

        let (run_id, outcome) = runner
            .start(&plan(&["ingestion", "validation"]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Cancelled {
                next_stage: "validation".into()
            }
        );
        assert_eq!(later.load(Ordering::SeqCst), 0);

        let run = runner.store().open(&run_id).await.unwrap();
        let state = run.checkpoint().load_state().await.unwrap();
        assert_eq!(state.current_stage.as_deref(), Some("ingestion"));
        assert_eq!(state.status, RunStatus::Running);
        let entries = run.audit().read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "finished despite cancellation");
    }

    #[tokio::test]
    async fn events_follow_the_pass() {
        let root = tempfile::tempdir().unwrap();
        let events = EventEmitter::new(64);
        let mut rx = events.subscribe();
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), OkHandler { key: "datasets" });
        let runner = PipelineRunner::new(
            RunStore::new(root.path()),
            StageExecutor::new(Arc::new(reg)).with_events(events),
        );

        runner.start(&plan(&["ingestion"])).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(RunEvent::PassStarted { start_index: 0, .. })));
        assert!(seen.contains(&RunEvent::StageStarted {
            stage: "ingestion".into(),
            index: 0
        }));
        assert!(matches!(seen.last(), Some(RunEvent::RunCompleted { .. })));
    }
}
