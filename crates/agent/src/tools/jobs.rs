//! TOOLKIT: Background Job Control

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use warden_jobs::{JobError, JobManager};

use super::{ToolError, ToolOutput, ToolTrait};

#[derive(Deserialize)]
struct JobIdArgs {
    job_id: String,
}

fn job_id_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "job_id": { "type": "string", "description": "Id returned by exec" } },
        "required": ["job_id"]
    })
}

/// Unknown ids are the model's mistake, not a tool fault
fn soft(err: JobError) -> Result<ToolOutput, ToolError> {
    match err {
        JobError::NotFound(_) | JobError::NotRunning(_) => Ok(ToolOutput::error(err.to_string())),
        other => Err(other.into()),
    }
}

pub struct JobOutputTool {
    jobs: Arc<JobManager>,
}

impl JobOutputTool {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ToolTrait for JobOutputTool {
    fn name(&self) -> &str {
        "job_output"
    }
    fn description(&self) -> &str {
        "Read the current output and status of a background job."
    }
    fn parameters(&self) -> serde_json::Value {
        job_id_schema()
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: JobIdArgs = serde_json::from_value(args)?;
        let output = match self.jobs.get_output(&args.job_id) {
            Ok(output) => output,
            Err(err) => return soft(err),
        };

        let mut text = format!("◆ JOB {} STATUS: {}", args.job_id, output.status);
        if let Some(code) = output.exit_code {
            text.push_str(&format!(" (EXIT CODE {})", code));
        }
        if !output.stdout.is_empty() {
            text.push_str(&format!("\nSTDOUT:\n{}", output.stdout));
        }
        if !output.stderr.is_empty() {
            text.push_str(&format!("\nSTDERR:\n{}", output.stderr));
        }
        Ok(ToolOutput::text(text))
    }
}

pub struct JobKillTool {
    jobs: Arc<JobManager>,
}

impl JobKillTool {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ToolTrait for JobKillTool {
    fn name(&self) -> &str {
        "job_kill"
    }
    fn description(&self) -> &str {
        "Terminate a running background job."
    }
    fn parameters(&self) -> serde_json::Value {
        job_id_schema()
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: JobIdArgs = serde_json::from_value(args)?;
        match self.jobs.kill(&args.job_id) {
            Ok(()) => Ok(ToolOutput::text(format!("◆ JOB {} KILLED", args.job_id))),
            Err(err) => soft(err),
        }
    }
}

pub struct JobListTool {
    jobs: Arc<JobManager>,
}

impl JobListTool {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ToolTrait for JobListTool {
    fn name(&self) -> &str {
        "job_list"
    }
    fn description(&self) -> &str {
        "List background jobs, oldest first."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(
        &self,
        _args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let jobs = self.jobs.list();
        if jobs.is_empty() {
            return Ok(ToolOutput::text("◆ NO BACKGROUND JOBS"));
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|job| {
                format!(
                    "{} [{}] {}{}",
                    job.id,
                    job.status,
                    job.command,
                    job.description
                        .as_deref()
                        .map(|d| format!(" ({})", d))
                        .unwrap_or_default()
                )
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}
