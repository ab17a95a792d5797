//! Approval gate: the state machine between "call selected" and "call executed".
//!
//! ```text
//! Pending ──► Approved
//!        ├──► ApprovedForAllMatching(rule)
//!        └──► Denied(feedback)
//! ```
//!
//! Calls that don't need approval, or that match an installed rule, resolve
//! immediately via [`ApprovalGate::evaluate`]. Everything else goes through
//! [`ApprovalGate::prompt`], which suspends the caller until the configured
//! [`Approver`] answers or the run is cancelled. Denial is a value, not an
//! error.

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use crate::rules::{ApprovalRule, RuleMatch, RuleScope, RuleTable};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const DEFAULT_DENIAL: &str = "The user denied this operation.";

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub description: String,
    pub preview: String,
    pub arguments: serde_json::Value,
    /// The argument rules match against when they don't name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_argument: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    ApprovedForAllMatching { rule: ApprovalRule },
    Denied { feedback: String },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(
            self,
            ApprovalDecision::Approved | ApprovalDecision::ApprovedForAllMatching { .. }
        )
    }
}

/// An approver's answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ApprovalResponse {
    ApproveOnce,
    /// Approve and install a rule so matching calls skip the prompt.
    ApproveMatching { matcher: RuleMatch, scope: RuleScope },
    Deny {
        #[serde(default)]
        feedback: Option<String>,
    },
}

/// Whoever decides on approval requests (a UI, a policy, a test script).
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

/// Approves everything.
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::ApproveOnce
    }
}

/// Denies everything with fixed feedback.
pub struct DenyAllApprover {
    feedback: String,
}

impl DenyAllApprover {
    pub fn new(feedback: impl Into<String>) -> Self {
        Self {
            feedback: feedback.into(),
        }
    }
}

#[async_trait]
impl Approver for DenyAllApprover {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::Deny {
            feedback: Some(self.feedback.clone()),
        }
    }
}

/// Decides synchronously through a closure.
pub struct FnApprover<F>(pub F);

#[async_trait]
impl<F> Approver for FnApprover<F>
where
    F: Fn(&ApprovalRequest) -> ApprovalResponse + Send + Sync,
{
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse {
        (self.0)(request)
    }
}

/// A request waiting on the other side of a [`ChannelApprover`].
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalResponse>,
}

impl PendingApproval {
    /// Answer the request. Returns false if the asking run already gave up.
    pub fn respond(self, response: ApprovalResponse) -> bool {
        self.responder.send(response).is_ok()
    }
}

/// Forwards requests over a channel to a front end and waits for the reply.
pub struct ChannelApprover {
    sender: mpsc::Sender<PendingApproval>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            responder: tx,
        };
        if self.sender.send(pending).await.is_err() {
            tracing::warn!(tool = %request.tool_name, "Approval channel closed, denying");
            return ApprovalResponse::Deny {
                feedback: Some("No approver is listening; the operation was not run.".into()),
            };
        }
        rx.await.unwrap_or(ApprovalResponse::Deny {
            feedback: Some("The approval prompt was dismissed.".into()),
        })
    }
}

pub struct ApprovalGate {
    rules: Arc<RuleTable>,
    approver: Arc<dyn Approver>,
    audit: Arc<AuditLogger>,
    auto_approve_all: bool,
}

impl ApprovalGate {
    pub fn new(rules: Arc<RuleTable>, approver: Arc<dyn Approver>, audit: Arc<AuditLogger>) -> Self {
        Self {
            rules,
            approver,
            audit,
            auto_approve_all: false,
        }
    }

    pub fn with_auto_approve_all(mut self, enabled: bool) -> Self {
        self.auto_approve_all = enabled;
        self
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    /// Resolve without prompting when possible. `None` means a human has to decide.
    pub fn evaluate(&self, request: &ApprovalRequest, requires_approval: bool) -> Option<ApprovalDecision> {
        if !requires_approval || self.auto_approve_all {
            return Some(ApprovalDecision::Approved);
        }
        let rule = self.rules.find_match(
            &request.tool_name,
            &request.arguments,
            request.primary_argument.as_deref(),
        )?;
        tracing::debug!(tool = %request.tool_name, rule_id = %rule.id, "Auto-approved by rule");
        self.record(request, AuditOutcome::Success, Some(format!("rule {}", rule.id)));
        Some(ApprovalDecision::ApprovedForAllMatching { rule })
    }

    /// Suspend until the approver answers or `cancel` fires.
    pub async fn prompt(&self, request: &ApprovalRequest, cancel: &CancellationToken) -> ApprovalDecision {
        let response = tokio::select! {
            response = self.approver.decide(request) => response,
            _ = cancel.cancelled() => {
                self.record(request, AuditOutcome::Denied, Some("cancelled".into()));
                return ApprovalDecision::Denied { feedback: "Cancelled by user.".into() };
            }
        };

        match response {
            ApprovalResponse::ApproveOnce => {
                self.record(request, AuditOutcome::Success, None);
                ApprovalDecision::Approved
            }
            ApprovalResponse::ApproveMatching { matcher, scope } => {
                let rule = ApprovalRule::new(request.tool_name.clone(), matcher, scope);
                match self.rules.install(rule.clone()) {
                    Ok(()) => {
                        self.audit.log(
                            AuditEvent::RuleInstalled {
                                tool_name: request.tool_name.clone(),
                            },
                            "user",
                            &rule.id,
                            AuditOutcome::Success,
                            None,
                        );
                    }
                    // The call itself was still approved; only the shortcut is lost.
                    Err(e) => tracing::warn!(error = %e, tool = %request.tool_name, "Failed to install approval rule"),
                }
                self.record(request, AuditOutcome::Success, Some(format!("rule {}", rule.id)));
                ApprovalDecision::ApprovedForAllMatching { rule }
            }
            ApprovalResponse::Deny { feedback } => {
                let feedback = feedback
                    .filter(|f| !f.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_DENIAL.to_string());
                self.record(request, AuditOutcome::Denied, Some(feedback.clone()));
                ApprovalDecision::Denied { feedback }
            }
        }
    }

    /// `evaluate`, falling back to `prompt`.
    pub async fn check(
        &self,
        request: &ApprovalRequest,
        requires_approval: bool,
        cancel: &CancellationToken,
    ) -> ApprovalDecision {
        match self.evaluate(request, requires_approval) {
            Some(decision) => decision,
            None => self.prompt(request, cancel).await,
        }
    }

    fn record(&self, request: &ApprovalRequest, outcome: AuditOutcome, details: Option<String>) {
        self.audit.log(
            AuditEvent::ApprovalDecision {
                tool_name: request.tool_name.clone(),
            },
            "user",
            &request.tool_call_id,
            outcome,
            details,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(tool: &str, path: &str) -> ApprovalRequest {
        ApprovalRequest {
            tool_call_id: "call_1".into(),
            tool_name: tool.into(),
            description: "Delete a file".into(),
            preview: format!("delete {path}"),
            arguments: json!({ "path": path }),
            primary_argument: Some("path".into()),
        }
    }

    fn gate(approver: Arc<dyn Approver>) -> ApprovalGate {
        ApprovalGate::new(
            Arc::new(RuleTable::in_memory()),
            approver,
            Arc::new(AuditLogger::new()),
        )
    }

    #[tokio::test]
    async fn calls_without_approval_requirement_pass() {
        let gate = gate(Arc::new(DenyAllApprover::new("no")));
        let decision = gate
            .check(&request("read_file", "a"), false, &CancellationToken::new())
            .await;
        assert_eq!(decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn denial_carries_feedback() {
        let gate = gate(Arc::new(DenyAllApprover::new("use a temp dir instead")));
        let decision = gate
            .check(&request("delete_file", "x.py"), true, &CancellationToken::new())
            .await;
        assert_eq!(
            decision,
            ApprovalDecision::Denied {
                feedback: "use a temp dir instead".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_feedback_gets_default() {
        let gate = gate(Arc::new(FnApprover(|_: &ApprovalRequest| ApprovalResponse::Deny {
            feedback: Some("  ".into()),
        })));
        let decision = gate.prompt(&request("delete_file", "a"), &CancellationToken::new()).await;
        assert_eq!(
            decision,
            ApprovalDecision::Denied {
                feedback: DEFAULT_DENIAL.into()
            }
        );
    }

    #[tokio::test]
    async fn approve_matching_installs_rule_that_short_circuits() {
        let gate = gate(Arc::new(FnApprover(|_: &ApprovalRequest| {
            ApprovalResponse::ApproveMatching {
                matcher: RuleMatch::Glob {
                    argument: None,
                    pattern: "*.tmp".into(),
                },
                scope: RuleScope::Session,
            }
        })));

        let first = gate
            .check(&request("delete_file", "a.tmp"), true, &CancellationToken::new())
            .await;
        assert!(matches!(first, ApprovalDecision::ApprovedForAllMatching { .. }));

        assert!(matches!(
            gate.evaluate(&request("delete_file", "x.tmp"), true),
            Some(ApprovalDecision::ApprovedForAllMatching { .. })
        ));
        assert!(gate.evaluate(&request("delete_file", "x.py"), true).is_none());
    }

    #[tokio::test]
    async fn channel_approver_suspends_until_answered() {
        let (approver, mut rx) = ChannelApprover::new(4);
        let gate = Arc::new(gate(Arc::new(approver)));

        let handle = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.check(&request("write_file", "a.rs"), true, &CancellationToken::new())
                    .await
            })
        };

        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.request.tool_name, "write_file");
        assert!(pending.respond(ApprovalResponse::ApproveOnce));
        assert_eq!(handle.await.unwrap(), ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn closed_channel_denies() {
        let (approver, rx) = ChannelApprover::new(1);
        drop(rx);
        let gate = gate(Arc::new(approver));
        let decision = gate.prompt(&request("write_file", "a"), &CancellationToken::new()).await;
        assert!(matches!(decision, ApprovalDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn cancellation_resolves_pending_request() {
        let (approver, _rx) = ChannelApprover::new(1);
        let gate = gate(Arc::new(approver));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let decision = gate.prompt(&request("write_file", "a"), &cancel).await;
        assert_eq!(
            decision,
            ApprovalDecision::Denied {
                feedback: "Cancelled by user.".into()
            }
        );
    }

    #[tokio::test]
    async fn decisions_are_audited() {
        let audit = Arc::new(AuditLogger::new());
        let gate = ApprovalGate::new(
            Arc::new(RuleTable::in_memory()),
            Arc::new(AutoApprover),
            audit.clone(),
        );
        gate.prompt(&request("write_file", "a"), &CancellationToken::new()).await;
        assert_eq!(audit.entries_by_outcome(AuditOutcome::Success).len(), 1);
    }
}
