//! TOOLKIT: Workspace file operations

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::path_utils::{display_path, validate_workspace_path};
use super::{ToolError, ToolOutput, ToolTrait};
use crate::edit::{EditError, EditResolver};
use crate::progress::ToolEffects;

fn modified(path: String) -> ToolEffects {
    ToolEffects {
        files_modified: vec![path],
        ..Default::default()
    }
}

pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[async_trait]
impl ToolTrait for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a UTF-8 file from the workspace."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string", "description": "File path, relative to the workspace" } },
            "required": ["path"]
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: ReadFileArgs = serde_json::from_value(args)?;
        let path = validate_workspace_path(&args.path, &self.workspace).await?;

        debug!("◆ READING: {:?}", path);
        if !path.exists() {
            return Ok(ToolOutput::error(format!("◆ NO FILE AT: {}", args.path)));
        }
        if !path.is_file() {
            return Ok(ToolOutput::error(format!("◆ NOT A FILE: {}", args.path)));
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolOutput::text(content)),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(ToolOutput::error(format!("◆ ACCESS DENIED: {}", args.path)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[async_trait]
impl ToolTrait for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write a file in the workspace, creating parent directories as needed."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: WriteFileArgs = serde_json::from_value(args)?;
        let path = validate_workspace_path(&args.path, &self.workspace).await?;

        debug!("◆ WRITING: {:?}", path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::write(&path, &args.content).await {
            Ok(_) => Ok(ToolOutput::text(format!(
                "◆ {} BYTES WRITTEN TO {}",
                args.content.len(),
                args.path
            ))
            .with_effects(modified(display_path(&path, &self.workspace)))),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(ToolOutput::error(format!("◆ ACCESS DENIED: {}", args.path)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Replace `old_string` with `new_string`, healing near-misses
pub struct EditFileTool {
    workspace: PathBuf,
    resolver: Arc<EditResolver>,
}

impl EditFileTool {
    pub fn new(workspace: PathBuf, resolver: Arc<EditResolver>) -> Self {
        Self {
            workspace,
            resolver,
        }
    }
}

#[derive(Deserialize)]
struct EditFileArgs {
    path: String,
    old_string: String,
    new_string: String,
}

#[async_trait]
impl ToolTrait for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replace old_string with new_string in a file. old_string must identify a single location; \
         small formatting differences are tolerated and reported."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" },
                "old_string": { "type": "string", "description": "Text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: EditFileArgs = serde_json::from_value(args)?;
        let path = validate_workspace_path(&args.path, &self.workspace).await?;

        debug!("◆ EDITING: {:?}", path);
        if !path.is_file() {
            return Ok(ToolOutput::error(format!("◆ NO FILE AT: {}", args.path)));
        }
        let content = tokio::fs::read_to_string(&path).await?;

        let resolution = match self
            .resolver
            .resolve(&content, &args.old_string, &args.new_string)
            .await
        {
            Ok(resolution) => resolution,
            Err(err @ (EditError::Ambiguous { .. } | EditError::Unresolved { .. })) => {
                return Ok(ToolOutput::error(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        tokio::fs::write(&path, &resolution.new_content).await?;
        Ok(ToolOutput::text(format!(
            "◆ EDITED {} AT LINE {} (match: {}, confidence {:.2})",
            args.path, resolution.line, resolution.strategy, resolution.confidence
        ))
        .with_effects(modified(display_path(&path, &self.workspace))))
    }
}

pub struct ListDirTool {
    workspace: PathBuf,
}

impl ListDirTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[derive(Deserialize)]
struct ListDirArgs {
    #[serde(default = "default_dir")]
    path: String,
}

fn default_dir() -> String {
    ".".to_string()
}

#[async_trait]
impl ToolTrait for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List the entries of a workspace directory."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string", "description": "Directory, defaults to the workspace root" } }
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: ListDirArgs = serde_json::from_value(args)?;
        let path = validate_workspace_path(&args.path, &self.workspace).await?;

        debug!("◆ LISTING: {:?}", path);
        if !path.exists() {
            return Ok(ToolOutput::error(format!("◆ NO DIRECTORY AT: {}", args.path)));
        }
        if !path.is_dir() {
            return Ok(ToolOutput::error(format!("◆ NOT A DIRECTORY: {}", args.path)));
        }
        let mut entries = tokio::fs::read_dir(&path).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let prefix = if entry.file_type().await?.is_dir() {
                "[DIR] "
            } else {
                "[FILE] "
            };
            items.push(format!("{}{}", prefix, name));
        }
        items.sort();
        if items.is_empty() {
            Ok(ToolOutput::text(format!("◆ EMPTY DIRECTORY: {}", args.path)))
        } else {
            Ok(ToolOutput::text(items.join("\n")))
        }
    }
}
