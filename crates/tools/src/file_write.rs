//! File write tool: write or create files with path validation.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use turnwright_core::error::ToolError;
use turnwright_core::tool::{OutputSink, Tool, ToolKind, ToolOutput};

use crate::resolve_path;

pub struct FileWriteTool {
    root: Option<PathBuf>,
}

impl FileWriteTool {
    /// Create a file write tool, optionally confined to `root`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and missing parent directories, overwrites if it exists."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::invalid_args("file_write", "missing 'path' argument"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::invalid_args("file_write", "missing 'content' argument"))?;

        let resolved = resolve_path("file_write", path, self.root.as_deref())?;
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(format!("write of '{path}' was interrupted")));
        }

        if let Some(parent) = resolved.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::failed("file_write", format!("failed to create directories: {e}"))
            })?;
        }

        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::failed("file_write", format!("failed to write {path}: {e}")))?;

        debug!(path = %resolved.display(), bytes = content.len(), "File written");
        Ok(
            ToolOutput::new(format!("Successfully wrote {} bytes to {path}", content.len()))
                .with_summary(format!("wrote {path}")),
        )
    }
}
