//! Durable per-run plan and state documents.
//!
//! The [`CheckpointStore`] owns `plan.json` (written once at run creation) and
//! `state.json` (overwritten on every stage transition).  Every write goes to
//! a temporary sibling, is flushed to disk, and is then renamed over the
//! target, so a reader never observes a half-written document.

use std::path::{Path, PathBuf};

use batchops_types::{BatchOpsError, Plan, Result, RunId, RunState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub const PLAN_FILE: &str = "plan.json";
pub const STATE_FILE: &str = "state.json";

/// Reads and writes the plan and state documents of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_id: RunId,
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(run_id: RunId, dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            dir: dir.into(),
        }
    }

    /// Persist the plan and the initial state of a new run.
    pub async fn create_run(&self, plan: &Plan) -> Result<RunState> {
        plan.validate().map_err(BatchOpsError::InvalidPlan)?;
        self.ensure_exists().await?;
        write_json_atomic(&self.dir.join(PLAN_FILE), plan).await?;
        let state = RunState::initial();
        write_json_atomic(&self.dir.join(STATE_FILE), &state).await?;
        tracing::debug!(run_id = %self.run_id, stages = plan.stages.len(), "Run plan written");
        Ok(state)
    }

    pub async fn load_plan(&self) -> Result<Plan> {
        let plan: Plan = self.read_document(PLAN_FILE).await?;
        plan.validate().map_err(|message| self.corrupt(PLAN_FILE, message))?;
        Ok(plan)
    }

    pub async fn load_state(&self) -> Result<RunState> {
        let state: RunState = self.read_document(STATE_FILE).await?;
        state
            .check_consistency()
            .map_err(|message| self.corrupt(STATE_FILE, message))?;
        Ok(state)
    }

    pub async fn save_state(&self, state: &RunState) -> Result<()> {
        self.ensure_exists().await?;
        write_json_atomic(&self.dir.join(STATE_FILE), state).await?;
        tracing::debug!(
            run_id = %self.run_id,
            stage = state.current_stage.as_deref().unwrap_or(""),
            status = %state.status,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn ensure_exists(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.dir).await? {
            Ok(())
        } else {
            Err(BatchOpsError::RunNotFound {
                run_id: self.run_id.to_string(),
            })
        }
    }

    async fn read_document<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.ensure_exists().await?;
        let path = self.dir.join(name);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.corrupt(name, "document is missing".into()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map_err(|e| self.corrupt(name, e.to_string()))
    }

    fn corrupt(&self, name: &str, message: String) -> BatchOpsError {
        BatchOpsError::CorruptState {
            run_id: self.run_id.to_string(),
            message: format!("{name}: {message}"),
        }
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes()).await
}

/// Write `bytes` to a temporary sibling of `path`, sync, then rename it into
/// place.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
