//! Safety layer for Codeward.
//!
//! Provides:
//! - **Approval gate**: suspends a run until a human decides on a side-effecting call
//! - **Approval rules**: auto-approve table (tool name, exact, glob), optionally persisted
//! - **Mode controller**: Normal / Plan gating of non-read-only tools
//! - **Path validation**: filesystem sandboxing for file tools
//! - **Audit logging**: structured record of every security decision

pub mod approval;
pub mod audit;
pub mod mode;
pub mod path;
pub mod rules;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalResponse, Approver, AutoApprover,
    ChannelApprover, DenyAllApprover, FnApprover, PendingApproval,
};
pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use mode::ModeController;
pub use path::{PathPolicy, PathValidationError};
pub use rules::{ApprovalRule, RuleError, RuleMatch, RuleScope, RuleTable};
