//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what let the assistant act on a workspace: read and write
//! files, run commands, search. Extension servers contribute tools through
//! the same trait.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the tool reported success
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    /// A tool-level failure the tool itself reported (e.g. non-zero exit).
    pub fn error(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The uniform failure envelope every dispatch error is normalized into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Machine-readable kind (`not_permitted`, `invalid_arguments`, ...)
    pub kind: String,
    pub message: String,
    pub recoverable: bool,
}

impl ToolFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            recoverable,
        }
    }
}

impl From<&ToolError> for ToolFailure {
    fn from(err: &ToolError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

impl From<ToolError> for ToolFailure {
    fn from(err: ToolError) -> Self {
        Self::from(&err)
    }
}

/// The core Tool trait.
///
/// Handlers never see mode or approval state; the dispatcher enforces both
/// before `execute` is reached.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Read-only tools have no side effects and may run in Plan mode.
    fn read_only(&self) -> bool {
        false
    }

    /// Whether a call must pass through the approval gate.
    fn requires_approval(&self) -> bool {
        !self.read_only()
    }

    /// Human-readable preview of what a call will do, shown when asking for approval.
    fn preview(&self, arguments: &serde_json::Value) -> String {
        format!("{}({})", self.name(), arguments)
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
