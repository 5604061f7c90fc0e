//! Built-in tool implementations for Turnwright.
//!
//! A small set of tools covering the three approval kinds: `file_read`
//! (read), `file_write` (edit) and `shell` (execute). Embedders register
//! their own tools alongside these.

pub mod file_read;
pub mod file_write;
pub mod shell;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use turnwright_core::error::ToolError;
use turnwright_core::tool::ToolRegistry;

pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use shell::ShellTool;

/// Create a registry with all built-in tools, scoped to `workspace_root`
/// when one is given.
pub fn default_registry(workspace_root: Option<PathBuf>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ShellTool::new(workspace_root.clone())));
    registry.register(Arc::new(FileReadTool::new(workspace_root.clone())));
    registry.register(Arc::new(FileWriteTool::new(workspace_root)));
    registry
}

/// Resolve `path` against an optional workspace root.
///
/// Relative paths are joined onto the root. With a root set, `..`
/// components and absolute paths outside the root are refused.
pub(crate) fn resolve_path(
    tool_name: &str,
    path: &str,
    root: Option<&Path>,
) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(path);
    let Some(root) = root else {
        return Ok(candidate.to_path_buf());
    };

    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::PermissionDenied {
            tool_name: tool_name.into(),
            reason: format!("path '{path}' must not contain '..'"),
        });
    }

    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    if !resolved.starts_with(root) {
        return Err(ToolError::PermissionDenied {
            tool_name: tool_name.into(),
            reason: format!("path '{path}' is outside the workspace {}", root.display()),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry(None);
        let mut names = registry.names();
        names.sort_unstable();
        assert_eq!(names, vec!["file_read", "file_write", "shell"]);
    }

    #[test]
    fn resolve_without_root_is_passthrough() {
        let p = resolve_path("t", "../x", None).unwrap();
        assert_eq!(p, PathBuf::from("../x"));
    }

    #[test]
    fn resolve_relative_inside_root() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_path("t", "src/main.rs", Some(root)).unwrap(),
            PathBuf::from("/work/src/main.rs")
        );
    }

    #[test]
    fn resolve_rejects_escape() {
        let root = Path::new("/work");
        assert!(resolve_path("t", "../etc/passwd", Some(root)).is_err());
        assert!(resolve_path("t", "/etc/passwd", Some(root)).is_err());
        assert!(resolve_path("t", "/work/a.txt", Some(root)).is_ok());
    }
}
