//! Transport and connector traits.
//!
//! A transport is one live connection to one server. A connector opens
//! transports from configuration; the manager only ever sees the traits, so
//! tests can substitute in-process fakes.

use crate::protocol::DiscoveredTool;
use async_trait::async_trait;
use codeward_config::ExtensionServerConfig;
use codeward_core::{ExtensionError, ToolOutput};
use std::sync::Arc;

#[async_trait]
pub trait ExtensionTransport: Send + Sync {
    /// Enumerate the server's tools.
    async fn discover(&self) -> Result<Vec<DiscoveredTool>, ExtensionError>;

    /// Call a tool by its server-local name.
    async fn invoke(&self, tool: &str, arguments: serde_json::Value) -> Result<ToolOutput, ExtensionError>;

    /// Tear the connection down. Calls still in flight fail with a transport error.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and handshake a transport for `server`.
    async fn open(
        &self,
        server: &str,
        config: &ExtensionServerConfig,
    ) -> Result<Arc<dyn ExtensionTransport>, ExtensionError>;
}
