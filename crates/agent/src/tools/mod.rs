//! OPERATIVE TOOLKIT

pub mod filesystem;
pub mod jobs;
pub mod path_utils;
pub mod shell;

pub use filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use jobs::{JobKillTool, JobListTool, JobOutputTool};
pub use path_utils::PathValidationError;
pub use shell::ExecTool;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use warden_jobs::{JobError, JobManager};
use warden_provider::Tool;

use crate::edit::{EditError, EditResolver};
use crate::progress::ToolEffects;

/// Tool failures surfaced to the model as error results
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("◆ TOOLKIT '{0}' NOT FOUND")]
    NotFound(String),

    #[error("◆ INVALID ARGUMENTS: {0}")]
    InvalidArgs(#[from] serde_json::Error),

    #[error("◆ {0}")]
    Path(#[from] PathValidationError),

    #[error("◆ IO ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Edit(#[from] EditError),

    #[error("{0}")]
    Job(#[from] JobError),

    #[error("◆ CANCELED")]
    Canceled,
}

/// What a tool hands back to the coordinator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub effects: ToolEffects,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Soft failure the model can act on
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn with_effects(mut self, effects: ToolEffects) -> Self {
        self.effects = effects;
        self
    }
}

type BoxedTool = Box<dyn ToolTrait + Send + Sync>;

#[async_trait]
pub trait ToolTrait: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    async fn execute(&self, args: Value, cancel: CancellationToken)
        -> Result<ToolOutput, ToolError>;
}

pub fn to_provider_tool(tool: &dyn ToolTrait) -> Tool {
    Tool::new(tool.name(), tool.description(), tool.parameters())
}

/// TOOLKIT registry, built once at startup
pub struct ToolRegistry {
    tools: BTreeMap<String, BoxedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register<T: ToolTrait + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        self.tools.insert(name, Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&(dyn ToolTrait + Send + Sync)> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions in name order
    pub fn definitions(&self) -> Vec<Tool> {
        self.tools
            .values()
            .map(|t| to_provider_tool(t.as_ref()))
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(args, cancel).await
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in tools against `workspace`
pub fn register_default_tools(
    registry: &mut ToolRegistry,
    workspace: &Path,
    jobs: Arc<JobManager>,
    resolver: Arc<EditResolver>,
    inline_budget: std::time::Duration,
) {
    let workspace = workspace.to_path_buf();

    registry.register(ReadFileTool::new(workspace.clone()));
    registry.register(WriteFileTool::new(workspace.clone()));
    registry.register(EditFileTool::new(workspace.clone(), resolver));
    registry.register(ListDirTool::new(workspace.clone()));

    registry.register(ExecTool::new(workspace, jobs.clone(), inline_budget));

    registry.register(JobOutputTool::new(jobs.clone()));
    registry.register(JobKillTool::new(jobs.clone()));
    registry.register(JobListTool::new(jobs));
}
