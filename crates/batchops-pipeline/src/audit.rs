//! Append-only audit trail of stage lifecycle events.
//!
//! Each [`LogEntry`] is written as one JSON line to `logs.jsonl`.  The engine
//! never reads this file to make decisions; it exists for operators and for
//! the run summary.

use std::path::PathBuf;

use batchops_types::{LogEntry, LogStatus, Result, RunId};
use tokio::io::AsyncWriteExt;

pub const LOG_FILE: &str = "logs.jsonl";

#[derive(Debug, Clone)]
pub struct AuditLog {
    run_id: RunId,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(run_id: RunId, dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            path: dir.into().join(LOG_FILE),
        }
    }

    /// Append one entry and flush it to disk before returning.
    pub async fn append(
        &self,
        stage: &str,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Result<LogEntry> {
        let entry = LogEntry::new(stage, status, message);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        tracing::debug!(run_id = %self.run_id, stage, status = %status, "Audit entry appended");
        Ok(entry)
    }

    /// Read every entry in append order. A line that cannot be parsed (for
    /// example one torn by a crash mid-write) is skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<LogEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    run_id = %self.run_id,
                    line = number + 1,
                    error = %e,
                    "Skipping unreadable audit entry"
                ),
            }
        }
        Ok(entries)
    }
}
