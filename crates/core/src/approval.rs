//! Approval policy types.
//!
//! The session layer owns the [`ApprovalMode`]; the scheduler only reads it
//! to decide whether a call needs an interactive confirmation, and asks an
//! [`ApprovalHandler`] when it does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::tool::ToolKind;

/// How much confirmation the user wants before tools run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Ask before any mutating tool runs
    #[default]
    Default,
    /// File edits are approved automatically; commands still ask
    AutoEdit,
    /// Everything is approved automatically
    Yolo,
}

impl ApprovalMode {
    /// Whether a tool of `kind` must be confirmed under this mode.
    pub fn requires_confirmation(self, kind: ToolKind) -> bool {
        match self {
            Self::Yolo => false,
            Self::AutoEdit => matches!(kind, ToolKind::Execute | ToolKind::Other),
            Self::Default => kind.is_mutating(),
        }
    }
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(Self::Default),
            "auto_edit" | "autoedit" => Ok(Self::AutoEdit),
            "yolo" => Ok(Self::Yolo),
            other => Err(format!("unknown approval mode '{other}'")),
        }
    }
}

/// What the approval handler is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub kind: ToolKind,
    pub args: Value,
}

/// The user's answer to a confirmation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Reject,
    /// Run with these arguments instead.
    Modify { args: Value },
}

/// Asks the user (or a policy engine) to confirm a tool call.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ApprovalDecision;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_defaults_to_default_mode() {
        assert_eq!(ApprovalMode::default(), ApprovalMode::Default);
    }

    #[test]
    fn yolo_never_asks() {
        for kind in [ToolKind::Read, ToolKind::Edit, ToolKind::Execute, ToolKind::Other] {
            assert!(!ApprovalMode::Yolo.requires_confirmation(kind));
        }
    }

    #[test]
    fn auto_edit_only_asks_for_commands() {
        assert!(!ApprovalMode::AutoEdit.requires_confirmation(ToolKind::Read));
        assert!(!ApprovalMode::AutoEdit.requires_confirmation(ToolKind::Edit));
        assert!(ApprovalMode::AutoEdit.requires_confirmation(ToolKind::Execute));
    }

    #[test]
    fn default_asks_for_mutating_tools() {
        assert!(!ApprovalMode::Default.requires_confirmation(ToolKind::Read));
        assert!(ApprovalMode::Default.requires_confirmation(ToolKind::Edit));
        assert!(ApprovalMode::Default.requires_confirmation(ToolKind::Execute));
    }

    #[test]
    fn parse_modes() {
        assert_eq!("YOLO".parse::<ApprovalMode>().unwrap(), ApprovalMode::Yolo);
        assert_eq!("auto-edit".parse::<ApprovalMode>().unwrap(), ApprovalMode::AutoEdit);
        assert!("sometimes".parse::<ApprovalMode>().is_err());
    }

    #[test]
    fn decision_serialization() {
        let json = serde_json::to_string(&ApprovalDecision::Modify {
            args: serde_json::json!({"path": "b.txt"}),
        })
        .unwrap();
        assert!(json.contains(r#""decision":"modify""#));
    }
}
