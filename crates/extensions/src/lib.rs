//! Extension tool servers.
//!
//! An extension server is an external process that contributes tools at
//! runtime. Each server has its own lifecycle
//! (`Disconnected → Connecting → Connected | Failed`) managed by
//! [`ExtensionManager`]; on connect its tools are registered into the shared
//! [`codeward_tools::ToolRegistry`] under `mcp__<server>__<tool>`, and removed
//! again before the transport is torn down.

pub mod manager;
pub mod protocol;
pub mod stdio;
pub mod tool;
pub mod transport;

pub use manager::{ExtensionManager, ServerState, ServerStatus};
pub use protocol::DiscoveredTool;
pub use stdio::{StdioConnector, StdioTransport};
pub use tool::{ExtensionTool, namespaced, split_namespaced};
pub use transport::{Connector, ExtensionTransport};
