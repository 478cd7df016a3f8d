use std::collections::HashMap;

use async_trait::async_trait;
use batchops_types::{BatchOpsError, Context, Result, StageOutcome};
use tokio::io::AsyncWriteExt;

use crate::handler::{StageHandler, StageInvocation};
use crate::handlers::expand_variables;

/// Exit code a command uses to report a domain failure unless configured
/// otherwise.
pub const DEFAULT_DOMAIN_FAILURE_EXIT_CODE: i32 = 3;

const MAX_REASON_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// CommandHandler — runs a stage as an external shell command
// ---------------------------------------------------------------------------

/// Runs `sh -c <command>` for a stage.
///
/// The child receives the context snapshot as JSON on stdin and the plan in
/// `BATCHOPS_*` environment variables.  Exit status 0 is success (a JSON
/// object printed on stdout is merged into the context), the configured
/// domain-failure code is a domain failure, anything else is a hard failure.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    inputs: Vec<String>,
    domain_failure_exit_code: i32,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: Vec::new(),
            domain_failure_exit_code: DEFAULT_DOMAIN_FAILURE_EXIT_CODE,
        }
    }

    /// Paths that must exist before the command is started.
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_domain_failure_exit_code(mut self, code: i32) -> Self {
        self.domain_failure_exit_code = code;
        self
    }

    async fn check_inputs(
        &self,
        invocation: &StageInvocation<'_>,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        for input in &self.inputs {
            let path = expand_variables(input, vars);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(BatchOpsError::MissingInput {
                    stage: invocation.stage.to_string(),
                    path,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for CommandHandler {
    async fn execute(
        &self,
        invocation: &StageInvocation<'_>,
        context: &Context,
    ) -> Result<StageOutcome> {
        let stage = invocation.stage;
        let vars = invocation.variables();
        self.check_inputs(invocation, &vars).await?;

        let command = expand_variables(&self.command, &shell_quoted(stage, &vars)?);
        tracing::info!(stage, command = %command, rebuild = invocation.rebuild, "Executing stage command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.env("BATCHOPS_RUN_ID", invocation.run_id.as_str())
            .env("BATCHOPS_RUN_DIR", invocation.run_dir)
            .env("BATCHOPS_PROVIDER", &invocation.plan.provider)
            .env("BATCHOPS_PIPELINE", &invocation.plan.pipeline)
            .env("BATCHOPS_SNAPSHOT_DATE", &invocation.plan.snapshot_date)
            .env("BATCHOPS_STAGE", stage)
            .env("BATCHOPS_REBUILD", if invocation.rebuild { "1" } else { "0" });
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| BatchOpsError::HandlerError {
            stage: stage.to_string(),
            message: format!("Failed to spawn command: {e}"),
        })?;

        // Feed stdin concurrently so a child that writes before reading
        // cannot deadlock against us.
        let payload = serde_json::to_vec(&context.snapshot().await)?;
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&payload).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BatchOpsError::HandlerError {
                stage: stage.to_string(),
                message: format!("Command execution failed: {e}"),
            })?;
        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                tracing::warn!(stage, error = %e, "Could not write context to command stdin");
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => {
                tracing::info!(stage, stdout_len = stdout.len(), "Stage command succeeded");
                Ok(success_outcome(stage, &stdout))
            }
            Some(code) if code == self.domain_failure_exit_code => {
                let reason = if stderr.is_empty() {
                    format!("Command reported a domain failure (exit code {code})")
                } else {
                    truncate(&stderr)
                };
                tracing::warn!(stage, exit_code = code, "Stage command reported a domain failure");
                Ok(StageOutcome::domain_failure(reason))
            }
            Some(code) => Err(BatchOpsError::HandlerError {
                stage: stage.to_string(),
                message: format!("Command exited with code {code}: {}", truncate(&stderr)),
            }),
            None => Err(BatchOpsError::HandlerError {
                stage: stage.to_string(),
                message: "Command was terminated by a signal".into(),
            }),
        }
    }
}

/// Quote every value so an expanded `${variable}` is always one shell word.
/// Templates therefore reference variables bare (`${run_dir}/out.json`), never
/// inside quotes.
fn shell_quoted(stage: &str, vars: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    vars.iter()
        .map(|(key, value)| {
            let quoted = shlex::try_quote(value).map_err(|e| BatchOpsError::HandlerError {
                stage: stage.to_string(),
                message: format!("Cannot pass ${{{key}}} to the shell: {e}"),
            })?;
            Ok((key.clone(), quoted.into_owned()))
        })
        .collect()
}

/// A JSON object on stdout becomes the context updates; any other non-empty
/// output is kept under `<stage>.stdout`.
fn success_outcome(stage: &str, stdout: &str) -> StageOutcome {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return StageOutcome::success("Command succeeded");
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => {
            let keys = map.len();
            StageOutcome::Success {
                updates: map.into_iter().collect(),
                notes: format!("Command succeeded ({keys} context keys)"),
            }
        }
        _ => StageOutcome::success("Command succeeded").with_update(
            format!("{stage}.stdout"),
            serde_json::Value::String(trimmed.to_string()),
        ),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_REASON_LEN {
        return text.to_string();
    }
    // Find a valid UTF-8 boundary at or before the limit
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_REASON_LEN)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}
