use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    Validation,
    Authorization,
    Sequence,
    Upstream,
}

impl ToolErrorKind {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::Sequence => "sequence",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures a tool invocation can resolve to. None of them is fatal to the
/// conversation: each is reported back to the model as the call's result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments: {}", summarize(.0))]
    Validation(Vec<FieldViolation>),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    Sequence(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl ToolError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldViolation::new(field, message)])
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::UnknownTool(_) => ToolErrorKind::UnknownTool,
            Self::Validation(_) => ToolErrorKind::Validation,
            Self::Authorization(_) => ToolErrorKind::Authorization,
            Self::Sequence(_) => ToolErrorKind::Sequence,
            Self::Upstream(_) => ToolErrorKind::Upstream,
        }
    }

    pub fn to_failure(&self) -> ToolFailure {
        ToolFailure {
            kind: self.kind(),
            message: self.to_string(),
            violations: match self {
                Self::Validation(violations) => violations.clone(),
                _ => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|violation| format!("{}: {}", violation.field, violation.message))
        .collect::<Vec<_>>()
        .join("; ")
}
