//! Run identity and the on-disk run directory.
//!
//! [`RunStore`] creates run directories under a root (`runs/` by default) and
//! hands out [`RunHandle`]s that bundle the run's [`CheckpointStore`] and
//! [`AuditLog`].  [`RunLock`] enforces a single writer per run.

use std::io::Write;
use std::path::{Path, PathBuf};

use batchops_types::{BatchOpsError, Plan, Result, RunId, RunState};

use crate::audit::AuditLog;
use crate::checkpoint::CheckpointStore;

pub const LOCK_FILE: &str = "run.lock";

/// Runs created within the same second get suffixes up to this bound.
const MAX_ID_ATTEMPTS: usize = 1000;

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    /// Create a new run directory and persist `plan` with the initial state.
    pub async fn create_run(&self, plan: &Plan) -> Result<(RunHandle, RunState)> {
        tokio::fs::create_dir_all(&self.root).await?;
        let now = chrono::Local::now();

        for attempt in 0..MAX_ID_ATTEMPTS {
            let run_id = RunId::from_timestamp(&now, attempt);
            let dir = self.run_dir(&run_id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    let handle = RunHandle::new(run_id, dir);
                    let state = match handle.checkpoint().create_run(plan).await {
                        Ok(state) => state,
                        Err(e) => {
                            if let Err(cleanup) = tokio::fs::remove_dir_all(handle.dir()).await {
                                tracing::warn!(
                                    run_id = %handle.run_id(),
                                    error = %cleanup,
                                    "Could not remove partially created run directory"
                                );
                            }
                            return Err(e);
                        }
                    };
                    tracing::info!(
                        run_id = %handle.run_id(),
                        provider = %plan.provider,
                        pipeline = %plan.pipeline,
                        snapshot_date = %plan.snapshot_date,
                        "Run created"
                    );
                    return Ok((handle, state));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(BatchOpsError::Other(format!(
            "Could not allocate a run id for {} after {MAX_ID_ATTEMPTS} attempts",
            RunId::from_timestamp(&now, 0)
        )))
    }

    /// Open an existing run.
    pub async fn open(&self, run_id: &RunId) -> Result<RunHandle> {
        let dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(BatchOpsError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(RunHandle::new(run_id.clone(), dir))
    }

    /// Ids of every run under the root, oldest first.
    pub async fn list(&self) -> Result<Vec<RunId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(id) = RunId::parse(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Access to one run directory.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    dir: PathBuf,
    checkpoint: CheckpointStore,
    audit: AuditLog,
}

impl RunHandle {
    fn new(run_id: RunId, dir: PathBuf) -> Self {
        Self {
            checkpoint: CheckpointStore::new(run_id.clone(), dir.clone()),
            audit: AuditLog::new(run_id.clone(), dir.clone()),
            run_id,
            dir,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Take the exclusive lock for this run.
    pub fn lock(&self) -> Result<RunLock> {
        RunLock::acquire(&self.run_id, &self.dir)
    }

    /// Remove a lock left behind by a process that was killed. Returns
    /// whether a lock file existed.
    pub async fn force_unlock(&self) -> Result<bool> {
        match tokio::fs::remove_file(self.dir.join(LOCK_FILE)).await {
            Ok(()) => {
                tracing::warn!(run_id = %self.run_id, "Stale run lock removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// RunLock
// ---------------------------------------------------------------------------

/// Exclusive ownership of a run for the duration of one run or resume pass.
///
/// The lock file is created with `create_new`, so exactly one holder can
/// exist; it is removed when the guard is dropped, including on error paths
/// and panics.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(run_id: &RunId, dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let payload = serde_json::json!({
                    "pid": std::process::id(),
                    "acquired_at": chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = writeln!(file, "{payload}").and_then(|()| file.sync_all()) {
                    tracing::warn!(run_id = %run_id, error = %e, "Could not record lock holder");
                }
                tracing::debug!(run_id = %run_id, "Run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                    .and_then(|v| v.get("pid").and_then(|p| p.as_u64()))
                    .map(|pid| format!("held by pid {pid}"))
                    .unwrap_or_else(|| "held by another process".to_string());
                Err(BatchOpsError::RunLocked {
                    run_id: run_id.to_string(),
                    holder,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BatchOpsError::RunNotFound {
                run_id: run_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
