//! Resume engine.
//!
//! Resuming a run continues after the stage recorded in `state.json`.  Stages
//! before that point whose outputs only ever lived in the context are
//! re-executed first (without checkpointing) so later stages see the same
//! context a straight-through run would have given them.

use std::time::Instant;

use batchops_types::{
    BatchOpsError, Context, Plan, Result, RunId, RunOutcome, RunState, RunStatus, StageOutcome,
};

use crate::engine::PipelineRunner;
use crate::events::RunEvent;
use crate::handler::{StageInvocation, StageRegistry};
use crate::summary;

/// What a resume pass has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Nothing left to execute.
    AlreadyComplete,
    /// Rebuild the stages at `rebuild` (plan indices, in order), then execute
    /// from `start_index`.
    Resume {
        start_index: usize,
        rebuild: Vec<usize>,
    },
}

/// Decide how to resume a run from its persisted plan and state.
///
/// Performs no I/O. Errors here must leave the run untouched.
pub fn plan_resume(
    run_id: &RunId,
    plan: &Plan,
    state: &RunState,
    registry: &StageRegistry,
) -> Result<ResumeDecision> {
    let start_index = match state.current_stage.as_deref() {
        None => 0,
        Some(stage) => {
            let index = plan
                .index_of(stage)
                .ok_or_else(|| BatchOpsError::InvalidResumeState {
                    run_id: run_id.to_string(),
                    message: format!("current stage '{stage}' is not part of the plan"),
                })?;
            index + 1
        }
    };

    if state.status == RunStatus::Completed || start_index >= plan.stages.len() {
        return Ok(ResumeDecision::AlreadyComplete);
    }

    registry.validate_plan(plan)?;

    let mut rebuild = Vec::new();
    for (index, stage) in plan.stages.iter().enumerate().take(start_index) {
        if !registry.is_durable(stage)? {
            rebuild.push(index);
        }
    }

    Ok(ResumeDecision::Resume {
        start_index,
        rebuild,
    })
}

impl PipelineRunner {
    /// Resume `run_id` after its last recorded stage.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunOutcome> {
        let run = self.store.open(run_id).await?;
        let lock = run.lock()?;
        let plan = run.checkpoint().load_plan().await?;
        let state = run.checkpoint().load_state().await?;

        let (start_index, rebuild) =
            match plan_resume(run_id, &plan, &state, self.executor.registry())? {
                ResumeDecision::AlreadyComplete => {
                    tracing::info!(
                        run_id = %run_id,
                        status = %state.status,
                        "Nothing to resume; all stages already executed"
                    );
                    if state.status == RunStatus::Completed {
                        if let Err(e) = summary::generate(&run).await {
                            tracing::warn!(run_id = %run_id, error = %e, "Could not write run summary");
                        }
                    }
                    return Ok(RunOutcome::Completed);
                }
                ResumeDecision::Resume {
                    start_index,
                    rebuild,
                } => (start_index, rebuild),
            };

        tracing::info!(
            run_id = %run_id,
            from_stage = %plan.stages[start_index],
            start_index,
            rebuild = rebuild.len(),
            "Resuming run"
        );

        // Rebuild failures are recorded against the checkpointed stage so the
        // checkpoint never moves backwards.
        let checkpointed = state.current_stage.clone().unwrap_or_default();
        let context = Context::new();
        for index in rebuild {
            let stage = &plan.stages[index];
            let registered = self.executor.registry().get(stage)?;
            let invocation = StageInvocation {
                run_id,
                run_dir: run.dir(),
                plan: &plan,
                stage,
                rebuild: true,
            };

            tracing::info!(run_id = %run_id, stage = %stage, index, "Rebuilding context-only stage");
            let started = Instant::now();
            match registered.invoke(&invocation, &context).await {
                Ok(StageOutcome::Success { updates, .. }) => {
                    context.apply_updates(updates).await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.executor.events().emit(RunEvent::StageRebuilt {
                        stage: stage.clone(),
                        duration_ms,
                    });
                }
                Ok(StageOutcome::DomainFailure { reason }) => {
                    tracing::warn!(run_id = %run_id, stage = %stage, reason = %reason, "Rebuild reported a domain failure");
                    self.executor
                        .record_failure_at(
                            &run,
                            &checkpointed,
                            stage,
                            &format!("rebuild of '{stage}' failed: {reason}"),
                            true,
                        )
                        .await?;
                    return Ok(RunOutcome::Failed {
                        stage: stage.clone(),
                        reason,
                    });
                }
                Err(err) => {
                    tracing::error!(run_id = %run_id, stage = %stage, error = %err, "Rebuild failed");
                    self.executor
                        .record_failure_at(
                            &run,
                            &checkpointed,
                            stage,
                            &format!("rebuild of '{stage}' failed: {err}"),
                            false,
                        )
                        .await?;
                    return Err(err);
                }
            }
        }

        self.executor
            .execute_from(&run, &lock, &plan, start_index, context)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{StageDefinition, StageHandler};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn execute(
            &self,
            _invocation: &StageInvocation<'_>,
            _context: &Context,
        ) -> Result<StageOutcome> {
            Ok(StageOutcome::success("noop"))
        }
    }

    fn registry() -> StageRegistry {
        let mut reg = StageRegistry::new();
        for stage in crate::handler::DEFAULT_STAGES {
            reg.register(StageDefinition::new(stage), Noop);
        }
        reg
    }

    fn plan() -> Plan {
        Plan::new(
            "acme",
            "propensity",
            "2024-01-31",
            crate::handler::DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    fn run_id() -> RunId {
        RunId::parse("20240131_120000").unwrap()
    }

    #[test]
    fn failed_stage_resumes_at_next_index_with_context_only_rebuild() {
        let decision =
            plan_resume(&run_id(), &plan(), &RunState::failed("train"), &registry()).unwrap();
        // ingestion and validation are context-only; import and feature_etl are on disk
        assert_eq!(
            decision,
            ResumeDecision::Resume {
                start_index: 5,
                rebuild: vec![0, 1],
            }
        );
    }

    #[test]
    fn crash_mid_stage_still_starts_after_it() {
        let decision =
            plan_resume(&run_id(), &plan(), &RunState::running("import"), &registry()).unwrap();
        assert_eq!(
            decision,
            ResumeDecision::Resume {
                start_index: 3,
                rebuild: vec![0, 1],
            }
        );
    }

    #[test]
    fn fresh_state_starts_from_the_beginning() {
        let decision =
            plan_resume(&run_id(), &plan(), &RunState::initial(), &registry()).unwrap();
        assert_eq!(
            decision,
            ResumeDecision::Resume {
                start_index: 0,
                rebuild: vec![],
            }
        );
    }

    #[test]
    fn completed_or_exhausted_runs_have_nothing_to_do() {
        let reg = registry();
        assert_eq!(
            plan_resume(&run_id(), &plan(), &RunState::completed("inference"), &reg).unwrap(),
            ResumeDecision::AlreadyComplete
        );
        assert_eq!(
            plan_resume(&run_id(), &plan(), &RunState::failed("inference"), &reg).unwrap(),
            ResumeDecision::AlreadyComplete
        );
    }

    #[test]
    fn stage_outside_the_plan_is_invalid() {
        let err = plan_resume(&run_id(), &plan(), &RunState::failed("scoring"), &registry())
            .unwrap_err();
        assert!(matches!(err, BatchOpsError::InvalidResumeState { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn unregistered_plan_stage_is_rejected() {
        let mut reg = StageRegistry::new();
        reg.register(StageDefinition::new("ingestion"), Noop);
        let err = plan_resume(&run_id(), &plan(), &RunState::failed("ingestion"), &reg)
            .unwrap_err();
        assert!(matches!(err, BatchOpsError::UnknownStage { .. }));
    }

    #[test]
    fn durability_override_removes_stage_from_rebuild() {
        let mut reg = registry();
        reg.register(StageDefinition::new("validation").durable(true), Noop);
        let decision = plan_resume(&run_id(), &plan(), &RunState::failed("import"), &reg).unwrap();
        assert_eq!(
            decision,
            ResumeDecision::Resume {
                start_index: 3,
                rebuild: vec![0],
            }
        );
    }
}
