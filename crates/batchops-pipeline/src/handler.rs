//! Stage handler trait, registered stage wrapper, and the stage registry.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use batchops_types::{BatchOpsError, Context, Plan, Result, RunId, StageOutcome};

/// Stages of the standard batch pipeline, in execution order.
pub const DEFAULT_STAGES: [&str; 6] = [
    "ingestion",
    "validation",
    "import",
    "feature_etl",
    "train",
    "inference",
];

/// Whether a standard stage leaves its output recoverable on disk.
///
/// Ingested datasets and the validation verdict only live in the context;
/// imported tables, feature tables, the saved model and predictions are
/// durable.
pub fn default_durability(stage: &str) -> Option<bool> {
    match stage {
        "ingestion" | "validation" => Some(false),
        "import" | "feature_etl" | "train" | "inference" => Some(true),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// StageHandler trait
// ---------------------------------------------------------------------------

/// Everything a handler may need to know about the stage it is executing.
#[derive(Debug, Clone, Copy)]
pub struct StageInvocation<'a> {
    pub run_id: &'a RunId,
    pub run_dir: &'a Path,
    pub plan: &'a Plan,
    pub stage: &'a str,
    /// `true` when the stage is re-executed only to repopulate the context
    /// before a resume.
    pub rebuild: bool,
}

impl StageInvocation<'_> {
    /// Variables available for `${name}` expansion in handler configuration.
    pub fn variables(&self) -> HashMap<String, String> {
        HashMap::from([
            ("provider".to_string(), self.plan.provider.clone()),
            ("pipeline".to_string(), self.plan.pipeline.clone()),
            ("snapshot_date".to_string(), self.plan.snapshot_date.clone()),
            ("run_id".to_string(), self.run_id.to_string()),
            ("run_dir".to_string(), self.run_dir.display().to_string()),
            ("stage".to_string(), self.stage.to_string()),
        ])
    }
}

/// The business logic of one stage.
///
/// Return `Ok(StageOutcome::Success)` to continue, `Ok(StageOutcome::DomainFailure)`
/// when a business rule rejects the input, and `Err` for anything that is not
/// the input's fault.  Handlers of durable stages must make their writes safe
/// to repeat.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(
        &self,
        invocation: &StageInvocation<'_>,
        context: &Context,
    ) -> Result<StageOutcome>;
}

// ---------------------------------------------------------------------------
// StageDefinition / RegisteredStage
// ---------------------------------------------------------------------------

/// Static declaration of a stage: durability and the context keys it
/// consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub id: String,
    pub durable: bool,
    pub requires: Vec<String>,
    pub produces: Vec<String>,
}

impl StageDefinition {
    /// A definition using the default durability for standard stages and
    /// `false` for anything else.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let durable = default_durability(&id).unwrap_or(false);
        Self {
            id,
            durable,
            requires: Vec::new(),
            produces: Vec::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn produces<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = keys.into_iter().map(Into::into).collect();
        self
    }
}

pub struct RegisteredStage {
    definition: StageDefinition,
    handler: Box<dyn StageHandler>,
}

impl RegisteredStage {
    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn is_durable(&self) -> bool {
        self.definition.durable
    }

    /// Check the declared inputs, run the handler, and warn about declared
    /// outputs the handler did not provide.
    pub async fn invoke(
        &self,
        invocation: &StageInvocation<'_>,
        context: &Context,
    ) -> Result<StageOutcome> {
        for key in &self.definition.requires {
            if !context.contains(key).await {
                return Err(BatchOpsError::MissingContext {
                    stage: self.definition.id.clone(),
                    key: key.clone(),
                });
            }
        }

        let outcome = self.handler.execute(invocation, context).await?;

        if let StageOutcome::Success { updates, .. } = &outcome {
            for key in &self.definition.produces {
                if !updates.contains_key(key) && !context.contains(key).await {
                    tracing::warn!(
                        stage = %self.definition.id,
                        key = %key,
                        "Stage did not produce a declared context key"
                    );
                }
            }
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// Maps stage identifiers to their handlers. Built once at startup.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<String, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `definition.id`, replacing any previous entry.
    pub fn register(&mut self, definition: StageDefinition, handler: impl StageHandler + 'static) {
        self.stages.insert(
            definition.id.clone(),
            RegisteredStage {
                definition,
                handler: Box::new(handler),
            },
        );
    }

    pub fn get(&self, stage: &str) -> Result<&RegisteredStage> {
        self.stages
            .get(stage)
            .ok_or_else(|| BatchOpsError::UnknownStage {
                stage: stage.to_string(),
            })
    }

    pub fn has(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    pub fn is_durable(&self, stage: &str) -> Result<bool> {
        Ok(self.get(stage)?.is_durable())
    }

    /// Reject a plan that names a stage this registry cannot execute.
    pub fn validate_plan(&self, plan: &Plan) -> Result<()> {
        match plan.stages.iter().find(|s| !self.has(s)) {
            Some(stage) => Err(BatchOpsError::UnknownStage {
                stage: stage.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
