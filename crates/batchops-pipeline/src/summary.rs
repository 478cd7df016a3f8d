//! Human-readable run summary (`summary.md`), written once a run completes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use batchops_types::{LogEntry, Plan, Result, RunState};
use serde::Deserialize;

use crate::checkpoint::write_atomic;
use crate::run_store::RunHandle;

pub const SUMMARY_FILE: &str = "summary.md";
pub const DQ_REPORT_FILE: &str = "dq_report.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const PREDICTIONS_FILE: &str = "predictions/predictions.csv";

/// `dq_report.json` as written by the validation stage.
#[derive(Debug, Clone, Deserialize)]
pub struct DataQualityReport {
    pub status: String,
    #[serde(default)]
    pub checks: BTreeMap<String, serde_json::Value>,
}

/// `metrics.json` as written by the training stage. Every field is optional
/// so a partial document still renders.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMetrics {
    pub roc_auc: Option<f64>,
    pub accuracy: Option<f64>,
    pub n_train: Option<u64>,
    pub n_test: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Write `summary.md` for a run, unless one already exists.
pub async fn generate(run: &RunHandle) -> Result<PathBuf> {
    let path = run.dir().join(SUMMARY_FILE);
    if tokio::fs::try_exists(&path).await? {
        tracing::debug!(run_id = %run.run_id(), "Summary already present; leaving it untouched");
        return Ok(path);
    }

    let plan = run.checkpoint().load_plan().await?;
    let state = run.checkpoint().load_state().await?;
    let entries = run.audit().read_all().await?;
    let dq: Option<DataQualityReport> = read_optional_json(&run.dir().join(DQ_REPORT_FILE)).await;
    let metrics: Option<ModelMetrics> = read_optional_json(&run.dir().join(METRICS_FILE)).await;
    let predictions = tokio::fs::try_exists(run.dir().join(PREDICTIONS_FILE))
        .await
        .unwrap_or(false)
        .then_some(PREDICTIONS_FILE);

    let content = render_summary(
        run.run_id().as_str(),
        &plan,
        &state,
        &entries,
        dq.as_ref(),
        metrics.as_ref(),
        predictions,
    );
    write_atomic(&path, content.as_bytes()).await?;
    Ok(path)
}

async fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable document in summary");
            None
        }
    }
}

/// Render the summary markdown.
pub fn render_summary(
    run_id: &str,
    plan: &Plan,
    state: &RunState,
    entries: &[LogEntry],
    dq: Option<&DataQualityReport>,
    metrics: Option<&ModelMetrics>,
    predictions: Option<&str>,
) -> String {
    let mut out = format!("# Run {run_id}\n\n");

    out.push_str("## Plan\n\n");
    out.push_str(&format!("- Provider: {}\n", plan.provider));
    out.push_str(&format!("- Pipeline: {}\n", plan.pipeline));
    out.push_str(&format!("- Snapshot date: {}\n", plan.snapshot_date));
    out.push_str(&format!("- Stages: {}\n", plan.stages.join(" → ")));
    out.push_str(&format!(
        "- Status: {} (updated {})\n\n",
        state.status,
        state.updated_at.to_rfc3339()
    ));

    out.push_str("## Stage timeline\n\n");
    out.push_str("| Time | Stage | Status | Message |\n|---|---|---|---|\n");
    for entry in entries {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.stage,
            entry.status,
            entry.message.replace('|', "\\|").replace('\n', " ")
        ));
    }
    out.push('\n');

    if let Some(dq) = dq {
        out.push_str(&format!("## Data quality: {}\n\n", dq.status));
        for (check, value) in &dq.checks {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("- {check}: {value}\n"));
        }
        out.push('\n');
    }

    if let Some(m) = metrics {
        out.push_str("## Model metrics\n\n");
        if let Some(v) = m.roc_auc {
            out.push_str(&format!("- ROC AUC: {v:.4}\n"));
        }
        if let Some(v) = m.accuracy {
            out.push_str(&format!("- Accuracy: {v:.4}\n"));
        }
        if let Some(v) = m.n_train {
            out.push_str(&format!("- Training rows: {v}\n"));
        }
        if let Some(v) = m.n_test {
            out.push_str(&format!("- Test rows: {v}\n"));
        }
        if !m.features.is_empty() {
            out.push_str(&format!("- Features: {}\n", m.features.join(", ")));
        }
        out.push('\n');
    }

    if let Some(p) = predictions {
        out.push_str(&format!("## Predictions\n\n`{p}`\n"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_store::RunStore;
    use batchops_types::LogStatus;

    fn plan() -> Plan {
        Plan::new(
            "acme",
            "propensity",
            "2024-01-31",
            vec!["validation".into(), "train".into()],
        )
        .unwrap()
    }

    #[test]
    fn render_includes_optional_sections_only_when_present() {
        let entries = vec![
            LogEntry::new("validation", LogStatus::Started, "stage 1 of 2"),
            LogEntry::new("validation", LogStatus::Completed, "a | b"),
        ];
        let bare = render_summary(
            "20240131_120000",
            &plan(),
            &RunState::completed("train"),
            &entries,
            None,
            None,
            None,
        );
        assert!(bare.starts_with("# Run 20240131_120000"));
        assert!(bare.contains("validation → train"));
        assert!(bare.contains("a \\| b"));
        assert!(!bare.contains("## Data quality"));
        assert!(!bare.contains("## Model metrics"));
        assert!(!bare.contains("## Predictions"));

        let dq = DataQualityReport {
            status: "PASS".into(),
            checks: BTreeMap::from([
                ("duplicate_customers".to_string(), serde_json::json!(0)),
                ("missing_email_status".to_string(), serde_json::json!("WARN")),
            ]),
        };
        let metrics = ModelMetrics {
            roc_auc: Some(0.81234),
            n_train: Some(800),
            features: vec!["tenure_days".into(), "txn_count".into()],
            ..Default::default()
        };
        let full = render_summary(
            "20240131_120000",
            &plan(),
            &RunState::completed("train"),
            &entries,
            Some(&dq),
            Some(&metrics),
            Some(PREDICTIONS_FILE),
        );
        assert!(full.contains("## Data quality: PASS"));
        assert!(full.contains("- missing_email_status: WARN"));
        assert!(full.contains("- duplicate_customers: 0"));
        assert!(full.contains("- ROC AUC: 0.8123"));
        assert!(!full.contains("Accuracy"));
        assert!(full.contains("tenure_days, txn_count"));
        assert!(full.contains("predictions/predictions.csv"));
    }

    #[tokio::test]
    async fn generate_reads_run_documents_and_writes_once() {
        let root = tempfile::tempdir().unwrap();
        let (run, _) = RunStore::new(root.path()).create_run(&plan()).await.unwrap();
        run.checkpoint()
            .save_state(&RunState::completed("train"))
            .await
            .unwrap();
        std::fs::write(
            run.dir().join(METRICS_FILE),
            r#"{"roc_auc": 0.75, "accuracy": 0.9, "n_train": 80, "n_test": 20, "features": ["age"]}"#,
        )
        .unwrap();
        std::fs::write(run.dir().join(DQ_REPORT_FILE), "not json").unwrap();

        let path = generate(&run).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("- Accuracy: 0.9000"));
        assert!(!text.contains("## Data quality"));

        std::fs::write(&path, "edited").unwrap();
        generate(&run).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "edited");
    }
}
