//! Adapter exposing a discovered extension tool through the [`Tool`] trait.

use crate::protocol::DiscoveredTool;
use crate::transport::ExtensionTransport;
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "mcp__";

/// `mcp__<server>__<tool>`
pub fn namespaced(server: &str, tool: &str) -> String {
    format!("{PREFIX}{server}__{tool}")
}

/// Split a namespaced name into `(server, tool)`.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

pub struct ExtensionTool {
    server: String,
    remote_name: String,
    name: String,
    description: String,
    schema: serde_json::Value,
    read_only: bool,
    transport: Arc<dyn ExtensionTransport>,
    call_timeout: Duration,
}

impl ExtensionTool {
    pub fn new(
        server: &str,
        discovered: DiscoveredTool,
        transport: Arc<dyn ExtensionTransport>,
        call_timeout: Duration,
    ) -> Self {
        let read_only = discovered.is_read_only();
        let description = if discovered.description.trim().is_empty() {
            format!("{} (from extension server {server})", discovered.name)
        } else {
            discovered.description
        };
        Self {
            server: server.to_string(),
            name: namespaced(server, &discovered.name),
            remote_name: discovered.name,
            description,
            schema: discovered.input_schema,
            read_only,
            transport,
            call_timeout,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

#[async_trait]
impl Tool for ExtensionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        tracing::debug!(server = %self.server, tool = %self.remote_name, "Calling extension tool");
        match tokio::time::timeout(self.call_timeout, self.transport.invoke(&self.remote_name, arguments)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
                recoverable: true,
            }),
            Err(_) => Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: format!(
                    "extension server {} did not answer within {}ms",
                    self.server,
                    self.call_timeout.as_millis()
                ),
                recoverable: true,
            }),
        }
    }
}
