//! # Codeward Core
//!
//! Domain types, traits, and error definitions for the Codeward
//! coding-assistant runtime. Every other crate depends inward on this one.
//!
//! ## Layout
//!
//! - [`message`]: conversation messages and the tool calls they carry
//! - [`session`]: sessions, the tool-call ledger, and token counters
//! - [`strategy`]: learned strategies and the book that holds them
//! - [`tool`] / [`provider`]: the collaborator traits the runtime drives
//! - [`event`]: the upward event stream
//! - [`mode`]: Normal / Plan operating modes

pub mod error;
pub mod event;
pub mod message;
pub mod mode;
pub mod provider;
pub mod session;
pub mod strategy;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{
    Error, ErrorEnvelope, ExtensionError, ProviderError, Result, SessionError, ToolError,
};
pub use event::{AgentEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use mode::OperatingMode;
pub use provider::{
    Capabilities, Completion, CompletionProvider, CompletionRequest, StreamChunk, ToolDefinition,
    Usage,
};
pub use session::{Session, SessionId, TokenCounters, ToolCall, ToolCallLedger, ToolOutcome};
pub use strategy::{Strategy, StrategyBook, StrategyTag};
pub use tool::{Tool, ToolFailure, ToolOutput};
