//! TOOLKIT: Terminal Operations
//!
//! Every command runs as a managed job. The tool waits inline up to a budget;
//! anything slower keeps running in the background and is reported by id.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_jobs::{BackgroundJob, JobManager, JobStatus};

use super::path_utils::validate_workspace_path;
use super::{ToolError, ToolOutput, ToolTrait};
use crate::progress::{TestOutcome, ToolEffects};

const MAX_OUTPUT_LEN: usize = 10000;

fn test_command_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:^|[\s;&|(])(?:cargo (?:test|nextest)|go test|pytest|python3? -m (?:pytest|unittest)|(?:npm|pnpm|yarn)(?: run)? test|jest|vitest|mvn test|gradle test|make test|ctest)\b",
        )
        .ok()
    })
    .as_ref()
}

/// Does `command` look like a test run?
pub fn is_test_command(command: &str) -> bool {
    test_command_regex().is_some_and(|re| re.is_match(command))
}

pub struct ExecTool {
    workspace: PathBuf,
    jobs: Arc<JobManager>,
    inline_budget: Duration,
}

impl ExecTool {
    pub fn new(workspace: PathBuf, jobs: Arc<JobManager>, inline_budget: Duration) -> Self {
        Self {
            workspace,
            jobs,
            inline_budget,
        }
    }
}

#[derive(Deserialize)]
struct ExecArgs {
    command: String,
    working_dir: Option<String>,
    #[serde(default)]
    run_in_background: bool,
    description: Option<String>,
}

#[async_trait]
impl ToolTrait for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }
    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Long-running commands continue as background \
         jobs; inspect them with job_output and stop them with job_kill."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command" },
                "working_dir": { "type": "string", "description": "Optional working directory inside the workspace" },
                "run_in_background": { "type": "boolean", "description": "Return immediately with a job id" },
                "description": { "type": "string", "description": "Short note on what the command does" }
            },
            "required": ["command"]
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: ExecArgs = serde_json::from_value(args)?;

        let working_dir = match &args.working_dir {
            Some(dir) => validate_workspace_path(dir, &self.workspace).await?,
            None => self.workspace.clone(),
        };

        debug!("◆ EXECUTING: {}", args.command);
        let id = self
            .jobs
            .start(&args.command, Some(working_dir), args.description.clone())?;

        let mut effects = ToolEffects {
            command: Some(args.command.clone()),
            ..Default::default()
        };

        if args.run_in_background {
            return Ok(ToolOutput::text(format!(
                "◆ JOB {} STARTED IN BACKGROUND\nUse job_output to read its output.",
                id
            ))
            .with_effects(effects));
        }

        let job = tokio::select! {
            job = self.jobs.wait(&id, self.inline_budget) => job?,
            _ = cancel.cancelled() => {
                if let Err(e) = self.jobs.kill(&id) {
                    warn!("◆ KILL ON CANCEL FAILED: {}", e);
                }
                return Err(ToolError::Canceled);
            }
        };

        if job.status.is_running() {
            return Ok(ToolOutput::text(format!(
                "◆ STILL RUNNING AFTER {} SECONDS AS JOB {}\n{}Use job_output to follow it or job_kill to stop it.",
                self.inline_budget.as_secs(),
                id,
                format_partial(&job)
            ))
            .with_effects(effects));
        }

        // Finished inline; nothing left to inspect later
        let _ = self.jobs.remove(&id);

        if is_test_command(&args.command) && job.status != JobStatus::Killed {
            effects.test = Some(if job.exit_code == Some(0) {
                TestOutcome::Passed
            } else {
                TestOutcome::Failed
            });
        }
        Ok(ToolOutput::text(format_output(&job)).with_effects(effects))
    }
}

fn format_partial(job: &BackgroundJob) -> String {
    if job.stdout.is_empty() {
        return String::new();
    }
    format!("Output so far:\n{}\n", truncate(&job.stdout))
}

/// stdout, then STDERR and EXIT CODE sections as needed
pub fn format_output(job: &BackgroundJob) -> String {
    let mut parts = Vec::new();
    if !job.stdout.is_empty() {
        parts.push(job.stdout.clone());
    }
    if !job.stderr.is_empty() {
        parts.push(format!("STDERR:\n{}", job.stderr));
    }
    match job.status {
        JobStatus::Killed => parts.push("◆ KILLED".to_string()),
        _ if job.exit_code != Some(0) => {
            parts.push(format!("EXIT CODE: {}", job.exit_code.unwrap_or(-1)))
        }
        _ => {}
    }
    let result = if parts.is_empty() {
        "(NO OUTPUT)".to_string()
    } else {
        parts.join("\n")
    };
    truncate(&result)
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_LEN {
        return text.to_string();
    }
    let mut cut = MAX_OUTPUT_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n◆ OUTPUT TRUNCATED: {} BYTES REMAINING",
        &text[..cut],
        text.len() - cut
    )
}
