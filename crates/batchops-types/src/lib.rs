//! Shared types, errors, context, and run state for the BatchOps orchestrator.
//!
//! This crate provides the foundational types used across the BatchOps crates:
//! - `BatchOpsError` — unified error taxonomy
//! - `Context` — in-memory artifact store threaded between stages of one pass
//! - `Plan` / `RunState` / `LogEntry` — the persisted run documents
//! - `StageOutcome` / `RunOutcome` — results of a single stage and of a pass

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Unified error type for all BatchOps subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BatchOpsError {
    // === Run lifecycle ===
    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("Corrupt state for run '{run_id}': {message}")]
    CorruptState { run_id: String, message: String },

    #[error("Cannot resume run '{run_id}': {message}")]
    InvalidResumeState { run_id: String, message: String },

    #[error("Run '{run_id}' is locked ({holder})")]
    RunLocked { run_id: String, holder: String },

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // === Stage registry ===
    #[error("Unknown stage '{stage}': no handler is registered for it")]
    UnknownStage { stage: String },

    #[error("Invalid stage manifest: {0}")]
    ManifestError(String),

    // === Stage handlers ===
    #[error("Missing input for stage '{stage}': {path}")]
    MissingInput { stage: String, path: String },

    #[error("Stage '{stage}' requires context key '{key}', which is not present")]
    MissingContext { stage: String, key: String },

    #[error("Stage '{stage}' failed: {message}")]
    HandlerError { stage: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BatchOpsError {
    /// Returns `true` if the same request may succeed when attempted later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchOpsError::RunLocked { .. })
    }

    /// Returns `true` if operator intervention is required before the run can
    /// make progress again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchOpsError::CorruptState { .. }
                | BatchOpsError::InvalidResumeState { .. }
                | BatchOpsError::UnknownStage { .. }
                | BatchOpsError::InvalidPlan(_)
        )
    }
}

/// A convenience alias for `Result<T, BatchOpsError>`.
pub type Result<T> = std::result::Result<T, BatchOpsError>;

// ---------------------------------------------------------------------------
// RunId — timestamp-derived run identifier
// ---------------------------------------------------------------------------

const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

fn run_id_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^\d{8}_\d{6}(_\d+)?$").expect("run id pattern is valid")
    })
}

/// Identifier of a run, e.g. `20240105_143000`.
///
/// Derived from the creation time at second resolution. Runs created within
/// the same second receive a numeric suffix (`20240105_143000_1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Build the id for a run created at `at`. `attempt` > 0 appends a
    /// disambiguating suffix.
    pub fn from_timestamp<Tz: chrono::TimeZone>(at: &chrono::DateTime<Tz>, attempt: usize) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        let base = at.format(RUN_ID_FORMAT).to_string();
        if attempt == 0 {
            Self(base)
        } else {
            Self(format!("{base}_{attempt}"))
        }
    }

    /// Parse user-supplied input. Anything that is not a well-formed id is
    /// rejected so it can never address a path outside the runs root.
    pub fn parse(s: &str) -> Result<Self> {
        if run_id_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(BatchOpsError::InvalidRunId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Plan — the immutable execution plan of a run
// ---------------------------------------------------------------------------

/// Execution plan written once when a run is created.
///
/// `stages` is the authoritative stage order for the lifetime of the run,
/// both for the first pass and for every resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub provider: String,
    pub pipeline: String,
    pub snapshot_date: String,
    pub stages: Vec<String>,
}

fn plan_name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("plan name pattern is valid")
    })
}

impl Plan {
    /// Build and validate a plan.
    pub fn new(
        provider: impl Into<String>,
        pipeline: impl Into<String>,
        snapshot_date: impl Into<String>,
        stages: Vec<String>,
    ) -> Result<Self> {
        let plan = Self {
            provider: provider.into(),
            pipeline: pipeline.into(),
            snapshot_date: snapshot_date.into(),
            stages,
        };
        plan.validate().map_err(BatchOpsError::InvalidPlan)?;
        Ok(plan)
    }

    /// Check the structural rules of a plan, returning a description of the
    /// first violation.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (field, value) in [("provider", &self.provider), ("pipeline", &self.pipeline)] {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
            if !plan_name_pattern().is_match(value) {
                return Err(format!(
                    "{field} '{value}' may only contain letters, digits, '_', '.' and '-' \
                     and must start with a letter or digit"
                ));
            }
        }
        chrono::NaiveDate::parse_from_str(&self.snapshot_date, "%Y-%m-%d").map_err(|e| {
            format!(
                "snapshot date '{}' is not an ISO date (YYYY-MM-DD): {e}",
                self.snapshot_date
            )
        })?;
        if self.stages.is_empty() {
            return Err("plan has no stages".into());
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.as_str()) {
                return Err(format!("stage '{stage}' appears more than once"));
            }
        }
        Ok(())
    }

    /// Position of `stage` in the plan.
    pub fn index_of(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn last_stage(&self) -> Option<&str> {
        self.stages.last().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// RunState — the checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.pad("running"),
            RunStatus::Completed => f.pad("completed"),
            RunStatus::Failed => f.pad("failed"),
        }
    }
}

/// Persisted progress of a run: the last stage entered and the overall status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub current_stage: Option<String>,
    pub status: RunStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RunState {
    /// State of a freshly created run that has not entered any stage.
    pub fn initial() -> Self {
        Self {
            current_stage: None,
            status: RunStatus::Running,
            updated_at: chrono::Utc::now(),
        }
    }

    /// State written immediately before `stage` starts executing.
    pub fn running(stage: impl Into<String>) -> Self {
        Self::at(stage, RunStatus::Running)
    }

    pub fn failed(stage: impl Into<String>) -> Self {
        Self::at(stage, RunStatus::Failed)
    }

    pub fn completed(last_stage: impl Into<String>) -> Self {
        Self::at(last_stage, RunStatus::Completed)
    }

    fn at(stage: impl Into<String>, status: RunStatus) -> Self {
        Self {
            current_stage: Some(stage.into()),
            status,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Terminal statuses must name the stage they refer to.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        match (self.status, &self.current_stage) {
            (RunStatus::Failed, None) => Err("status is 'failed' but no stage is recorded".into()),
            (RunStatus::Completed, None) => {
                Err("status is 'completed' but no stage is recorded".into())
            }
            (_, Some(stage)) if stage.is_empty() => Err("current stage is an empty string".into()),
            _ => Ok(()),
        }
    }

    /// The run is fresh: created but never entered a stage.
    pub fn is_fresh(&self) -> bool {
        self.current_stage.is_none() && self.status == RunStatus::Running
    }
}

// ---------------------------------------------------------------------------
// LogEntry — one audit record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStatus::Started => f.pad("started"),
            LogStatus::Completed => f.pad("completed"),
            LogStatus::Failed => f.pad("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stage: String,
    pub status: LogStatus,
    pub message: String,
}

impl LogEntry {
    pub fn new(stage: impl Into<String>, status: LogStatus, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stage: stage.into(),
            status,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Context — in-memory artifacts of one executor pass
// ---------------------------------------------------------------------------

/// Key-value store of the artifacts produced by stages during one pass.
///
/// A context is never persisted. Cloning yields another handle to the
/// **same** inner map, so a handler sees the updates of the stages before it.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<HashMap<String, serde_json::Value>>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.clone()
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        self.inner.write().await.extend(updates);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StageOutcome — result of one handler invocation
// ---------------------------------------------------------------------------

/// What a stage handler reports back to the executor.
///
/// Hard failures are not represented here: a handler returns `Err` for those.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage finished; `updates` are merged into the context.
    Success {
        updates: HashMap<String, serde_json::Value>,
        notes: String,
    },
    /// A business rule rejected the input (e.g. a data-quality check failed).
    DomainFailure { reason: String },
}

impl StageOutcome {
    /// Create a successful outcome with no context updates.
    pub fn success(notes: impl Into<String>) -> Self {
        StageOutcome::Success {
            updates: HashMap::new(),
            notes: notes.into(),
        }
    }

    /// Create a domain failure with the given reason.
    pub fn domain_failure(reason: impl Into<String>) -> Self {
        StageOutcome::DomainFailure {
            reason: reason.into(),
        }
    }

    /// Add a context update to a successful outcome. No-op on failures.
    pub fn with_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let StageOutcome::Success { updates, .. } = &mut self {
            updates.insert(key.into(), value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// RunOutcome — result of one executor pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage of the plan has completed.
    Completed,
    /// `stage` reported a domain failure; later stages were not attempted.
    Failed { stage: String, reason: String },
    /// Cancellation was observed before `next_stage` started.
    Cancelled { next_stage: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}
