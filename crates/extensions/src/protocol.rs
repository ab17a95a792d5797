//! JSON-RPC 2.0 message shapes for the extension protocol.
//!
//! Only the subset the client needs: `initialize`, `tools/list` and
//! `tools/call`, plus notifications.

use codeward_core::ToolOutput;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Anything the server writes: a response (has `id`) or a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// The numeric id of a response. Server-initiated requests also carry
    /// an id but have a `method`, so they're excluded.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "codeward",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// A tool advertised by a server during discovery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveredTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: Option<ToolAnnotations>,
}

impl DiscoveredTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.annotations = Some(ToolAnnotations { read_only_hint: true });
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.annotations.as_ref().is_some_and(|a| a.read_only_hint)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, rename = "readOnlyHint")]
    pub read_only_hint: bool,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<DiscoveredTool>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text blocks joined by newlines; non-text blocks are noted, not inlined.
    pub fn into_output(self) -> ToolOutput {
        let mut skipped = 0usize;
        let mut parts = Vec::new();
        for block in self.content {
            match block {
                ContentBlock::Text { text } => parts.push(text),
                ContentBlock::Other => skipped += 1,
            }
        }
        if skipped > 0 {
            parts.push(format!("[{skipped} non-text content block(s) omitted]"));
        }
        let text = parts.join("\n");
        if self.is_error {
            ToolOutput::error(text)
        } else {
            ToolOutput::ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_empty_fields() {
        let json = serde_json::to_value(JsonRpcRequest::notification("notifications/initialized", None)).unwrap();
        assert_eq!(json, serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));

        let json = serde_json::to_value(JsonRpcRequest::new(7, "tools/list", Some(serde_json::json!({})))).unwrap();
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn discovered_tool_reads_wire_names() {
        let tool: DiscoveredTool = serde_json::from_value(serde_json::json!({
            "name": "query",
            "description": "Run SQL",
            "inputSchema": {"type": "object", "properties": {"sql": {"type": "string"}}},
            "annotations": {"readOnlyHint": true}
        }))
        .unwrap();
        assert!(tool.is_read_only());
        assert_eq!(tool.input_schema["properties"]["sql"]["type"], "string");

        let bare: DiscoveredTool = serde_json::from_value(serde_json::json!({"name": "ping"})).unwrap();
        assert!(!bare.is_read_only());
        assert_eq!(bare.input_schema, serde_json::json!({"type": "object"}));
    }

    #[test]
    fn call_result_becomes_tool_output() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "line two"}
            ]
        }))
        .unwrap();
        let output = result.into_output();
        assert!(output.success);
        assert_eq!(output.output, "line one\nline two\n[1 non-text content block(s) omitted]");

        let failed: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "no such table"}],
            "isError": true
        }))
        .unwrap();
        assert!(!failed.into_output().success);
    }

    #[test]
    fn server_requests_are_not_responses() {
        let msg: JsonRpcMessage =
            serde_json::from_value(serde_json::json!({"jsonrpc": "2.0", "id": 3, "method": "roots/list"})).unwrap();
        assert_eq!(msg.response_id(), None);
        let msg: JsonRpcMessage =
            serde_json::from_value(serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": {}})).unwrap();
        assert_eq!(msg.response_id(), Some(3));
    }
}
