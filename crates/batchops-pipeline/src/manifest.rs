//! Stage manifest (`stages.json`): declares which command implements each
//! stage and how its output is persisted.
//!
//! ```json
//! {
//!   "stages": [
//!     { "id": "ingestion", "command": "python -m src.ingestion ${provider} ${run_dir}",
//!       "inputs": ["configs/${provider}.yaml"], "produces": ["datasets"] },
//!     { "id": "validation", "command": "python -m src.validation ${run_dir}",
//!       "requires": ["datasets"] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use batchops_types::{BatchOpsError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::handler::{default_durability, StageDefinition, StageRegistry};
use crate::handlers::CommandHandler;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageManifest {
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub id: String,
    pub command: String,
    /// Falls back to the standard durability table, then to `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    /// Paths checked for existence before the command starts.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_failure_exit_code: Option<i32>,
}

fn stage_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("stage id pattern is valid"))
}

impl StageManifest {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await.map_err(|e| {
            BatchOpsError::ManifestError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(data)
            .map_err(|e| BatchOpsError::ManifestError(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(BatchOpsError::ManifestError("no stages declared".into()));
        }
        let mut seen = HashSet::new();
        for entry in &self.stages {
            if !stage_id_pattern().is_match(&entry.id) {
                return Err(BatchOpsError::ManifestError(format!(
                    "invalid stage id '{}': expected lowercase letters, digits and underscores",
                    entry.id
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(BatchOpsError::ManifestError(format!(
                    "stage '{}' declared more than once",
                    entry.id
                )));
            }
            if entry.command.trim().is_empty() {
                return Err(BatchOpsError::ManifestError(format!(
                    "stage '{}' has an empty command",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Stage ids in declaration order; the default plan when none is given.
    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    pub fn into_registry(self) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for entry in self.stages {
            let durable = entry
                .durable
                .or_else(|| default_durability(&entry.id))
                .unwrap_or(false);
            let definition = StageDefinition::new(entry.id.clone())
                .durable(durable)
                .requires(entry.requires)
                .produces(entry.produces);

            let mut handler = CommandHandler::new(entry.command).with_inputs(entry.inputs);
            if let Some(code) = entry.domain_failure_exit_code {
                handler = handler.with_domain_failure_exit_code(code);
            }
            tracing::debug!(stage = %entry.id, durable, "Registered stage");
            registry.register(definition, handler);
        }
        registry
    }
}
