//! File read tool: read file contents with path validation.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use turnwright_core::error::ToolError;
use turnwright_core::tool::{OutputSink, Tool, ToolKind, ToolOutput};

use crate::resolve_path;

/// Largest number of bytes returned in one read.
const MAX_BYTES: usize = 256 * 1024;

pub struct FileReadTool {
    root: Option<PathBuf>,
}

impl FileReadTool {
    /// Create a file read tool, optionally confined to `root`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Select `limit` lines starting at zero-based line `offset`.
fn slice_lines(content: &str, offset: usize, limit: Option<usize>) -> String {
    let lines = content.lines().skip(offset);
    match limit {
        Some(limit) => lines.take(limit).collect::<Vec<_>>().join("\n"),
        None => lines.collect::<Vec<_>>().join("\n"),
    }
}

fn truncate_to_boundary(mut text: String, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path. Optionally read a window of lines."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Zero-based line to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::invalid_args("file_read", "missing 'path' argument"))?;
        let resolved = resolve_path("file_read", path, self.root.as_deref())?;

        let content = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolError::Cancelled(format!("read of '{path}' was interrupted"))),
            read = tokio::fs::read_to_string(&resolved) => read
                .map_err(|e| ToolError::failed("file_read", format!("failed to read {path}: {e}")))?,
        };

        let offset = args["offset"].as_u64().unwrap_or(0) as usize;
        let limit = args["limit"].as_u64().map(|l| l as usize);
        let windowed = if offset == 0 && limit.is_none() {
            content
        } else {
            slice_lines(&content, offset, limit)
        };

        let (text, truncated) = truncate_to_boundary(windowed, MAX_BYTES);
        let summary = if truncated {
            format!("read {path} (truncated to {MAX_BYTES} bytes)")
        } else {
            format!("read {path}")
        };
        Ok(ToolOutput::new(text).with_summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn run(tool: &FileReadTool, args: Value) -> Result<ToolOutput, ToolError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(tool.execute(args, CancellationToken::new(), OutputSink::noop()))
    }

    #[test]
    fn tool_definition() {
        let tool = FileReadTool::default();
        assert_eq!(tool.name(), "file_read");
        assert_eq!(tool.kind(), ToolKind::Read);
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["path"]));
    }

    #[test]
    fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        let mut f = std::fs::File::create(&file_path).unwrap();
        writeln!(f, "Hello, world!").unwrap();

        let result = run(
            &FileReadTool::default(),
            serde_json::json!({ "path": file_path.to_str().unwrap() }),
        )
        .unwrap();
        assert!(result.output.contains("Hello, world!"));
    }

    #[test]
    fn read_line_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let tool = FileReadTool::new(Some(dir.path().to_path_buf()));
        let result = run(
            &tool,
            serde_json::json!({ "path": "lines.txt", "offset": 1, "limit": 2 }),
        )
        .unwrap();
        assert_eq!(result.output, "two\nthree");
    }

    #[test]
    fn read_nonexistent_file_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let err = run(
            &FileReadTool::default(),
            serde_json::json!({ "path": missing.to_str().unwrap() }),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[test]
    fn path_traversal_blocked() {
        let tool = FileReadTool::new(Some(PathBuf::from("/home/user/workspace")));
        let err = run(&tool, serde_json::json!({ "path": "../../../etc/passwd" })).unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn schema_rejects_bad_offset() {
        let tool = FileReadTool::default();
        assert!(
            tool.validate_arguments(&serde_json::json!({ "path": "a", "offset": -1 }))
                .is_err()
        );
        assert!(tool.validate_arguments(&serde_json::json!({})).is_err());
        assert!(tool.validate_arguments(&serde_json::json!({ "path": "a" })).is_ok());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (text, truncated) = truncate_to_boundary("héllo".to_string(), 2);
        assert!(truncated);
        assert_eq!(text, "h");
    }
}
