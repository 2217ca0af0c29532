//! System prompt assembly

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::progress::ProgressSummary;
use crate::state::Phase;

/// Builds the system prompt sent with every provider request
pub struct ContextBuilder {
    workspace: PathBuf,
}

impl ContextBuilder {
    /// Project instruction files picked up from the workspace root
    const BOOTSTRAP_FILES: &'static [&'static str] = &["AGENTS.md", "WARDEN.md"];

    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub async fn build_system_prompt(&self, phase: Phase, progress: &ProgressSummary) -> String {
        let mut parts = vec![self.identity(), Self::phase_guidance(phase, progress)];

        let bootstrap = self.load_bootstrap_files().await;
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        format!(
            r#"# warden

You are an autonomous coding agent. You work by calling tools:
- read_file, write_file, edit_file, list_dir for the workspace
- exec for shell commands; slow commands continue as background jobs
- job_output, job_kill, job_list to manage those jobs

## Current Time
{}

## Workspace
All paths are relative to: {}

Prefer edit_file over rewriting whole files. When the task is complete,
reply with a short summary and no tool calls."#,
            now,
            self.workspace.display()
        )
    }

    fn phase_guidance(phase: Phase, progress: &ProgressSummary) -> String {
        let focus = match phase {
            Phase::Planning => "Explore the workspace and decide on an approach before changing files.",
            Phase::Implementation => "Make the changes. Run the tests once the change is in place.",
            Phase::Validation => "Run the tests and read failures carefully before editing again.",
            Phase::Refinement => "Fix what validation found and re-run the affected tests.",
        };
        format!(
            "## Phase: {}\n{}\n\nFiles modified: {}. Commands run: {}. Test runs: {} ({} failed).",
            phase,
            focus,
            progress.files_modified,
            progress.commands_executed,
            progress.tests_run,
            progress.tests_failed
        )
    }

    async fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();
        for filename in Self::BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if !path.is_file() {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => parts.push(format!("## {}\n\n{}", filename, content)),
                Err(e) => debug!("Failed to read {}: {}", filename, e),
            }
        }
        parts.join("\n\n")
    }
}
