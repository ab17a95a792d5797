//! The ReAct orchestrator: Thought → Action → Observation until the model
//! stops calling tools or the iteration cap is reached.
//!
//! Each iteration:
//!
//! 1. Compact the session if its estimated context crossed the threshold
//! 2. Build a token-budgeted payload (system prompt, strategies, plan,
//!    tool schemas allowed by the current mode, history)
//! 3. Stream the completion under a timeout, racing cancellation, and
//!    publish each text delta as it arrives
//! 4. No tool calls: append the answer and finish
//! 5. Otherwise, for each call in order: mode check → approval → dispatch,
//!    appending one `tool_result` message per call
//!
//! Every issued call reaches exactly one terminal outcome in the session's
//! ledger, including calls skipped by cancellation or the iteration cap.

use codeward_config::{AgentSettings, IterationCapPolicy};
use codeward_core::{
    AgentEvent, Completion, CompletionProvider, CompletionRequest, Error, EventBus, Message,
    MessageToolCall, ProviderError, Result, Session, ToolCall, ToolOutcome,
};
use codeward_security::{ApprovalDecision, ApprovalGate, ApprovalRequest, ModeController};
use codeward_session::{PayloadExtras, SessionStore};
use codeward_tools::Dispatcher;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const THINKING_PROMPT: &str = "Before acting, think the request through. \
Reply with a short numbered plan: the steps you will take and the tools you expect to use. \
Do not call any tools and do not answer the request yet.";

const CANCELLED_BEFORE_EXECUTION: &str = "cancelled before execution";
const CAP_REACHED: &str = "iteration limit reached before execution";

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The model answered without calling tools.
    Answer { text: String, iterations: usize },
    /// The iteration cap was reached with the model still calling tools.
    Incomplete {
        iterations: usize,
        /// Text the model sent alongside its last tool calls, if any
        last_text: Option<String>,
    },
}

impl RunOutcome {
    pub fn is_answer(&self) -> bool {
        matches!(self, RunOutcome::Answer { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            RunOutcome::Answer { text, .. } => Some(text),
            RunOutcome::Incomplete { last_text, .. } => last_text.as_deref(),
        }
    }

    pub fn iterations(&self) -> usize {
        match self {
            RunOutcome::Answer { iterations, .. } | RunOutcome::Incomplete { iterations, .. } => *iterations,
        }
    }
}

/// How a single call was resolved, before it's written to the session.
struct Resolution {
    outcome: ToolOutcome,
    content: String,
    synthetic: bool,
}

impl Resolution {
    fn succeeded(output: String) -> Self {
        Self {
            outcome: ToolOutcome::Succeeded,
            content: output,
            synthetic: false,
        }
    }

    fn failed(message: String, recoverable: bool, synthetic: bool) -> Self {
        Self {
            content: format!("Error: {message}"),
            outcome: ToolOutcome::Failed { message, recoverable },
            synthetic,
        }
    }

    fn denied(tool: &str, feedback: String) -> Self {
        Self {
            content: format!("The user denied the {tool} call. Feedback: {feedback}"),
            outcome: ToolOutcome::Denied { feedback },
            synthetic: true,
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn CompletionProvider>,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<ApprovalGate>,
    mode: Arc<ModeController>,
    store: Arc<SessionStore>,
    events: EventBus,
    settings: AgentSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        dispatcher: Arc<Dispatcher>,
        gate: Arc<ApprovalGate>,
        mode: Arc<ModeController>,
        store: Arc<SessionStore>,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            gate,
            mode,
            store,
            events,
            settings: AgentSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.settings.max_iterations = max.max(1);
        self
    }

    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.settings.thinking = enabled;
        self
    }

    pub fn with_cap_policy(mut self, policy: IterationCapPolicy) -> Self {
        self.settings.cap_policy = policy;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Drive one user request to completion.
    ///
    /// The session is persisted after every append, so whatever happened up
    /// to an error or cancellation is kept and the session stays resumable.
    pub async fn run(&self, session: &mut Session, input: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        info!(
            session_id = %session.id,
            messages = session.messages.len(),
            provider = self.provider.name(),
            "Starting run"
        );

        let result = self.drive(session, input, cancel).await;
        let session_id = session.id.to_string();
        match &result {
            Ok(outcome) => {
                info!(%session_id, iterations = outcome.iterations(), answered = outcome.is_answer(), "Run finished");
                self.events.publish(AgentEvent::RunFinished {
                    session_id,
                    iterations: outcome.iterations(),
                    incomplete: !outcome.is_answer(),
                });
            }
            Err(e) => {
                if e.is_failure() {
                    warn!(%session_id, error = %e, "Run failed");
                } else {
                    info!(%session_id, "Run cancelled");
                }
                self.events.publish(AgentEvent::Error {
                    session_id,
                    error: e.envelope(),
                });
            }
        }
        result
    }

    async fn drive(&self, session: &mut Session, input: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.store.append(session, Message::user(input)).await?;

        let plan = if self.settings.thinking {
            self.think(session, cancel).await?
        } else {
            None
        };

        let max_iterations = self.settings.max_iterations.max(1);
        let mut run_call_ids: Vec<String> = Vec::new();
        let mut last_text: Option<String> = None;

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(session_id = %session.id, iteration, "Agent loop iteration");
            self.events.publish(AgentEvent::IterationStarted {
                session_id: session.id.to_string(),
                iteration,
            });

            if self.store.needs_compaction(session)
                && let Some(report) = self.store.compact(session).await?
            {
                self.events.publish(AgentEvent::Compacted {
                    session_id: session.id.to_string(),
                    messages_folded: report.messages_folded,
                    tokens_before: report.tokens_before,
                    tokens_after: report.tokens_after,
                });
            }

            let completion = self.next_completion(session, iteration, plan.as_deref(), cancel).await?;
            self.store.record_usage(session, completion.usage);

            if completion.tool_calls.is_empty() {
                self.store
                    .append(session, Message::assistant(completion.text.clone()))
                    .await?;
                self.events.publish(AgentEvent::IterationComplete {
                    session_id: session.id.to_string(),
                    iteration,
                    tool_calls: 0,
                });
                self.learn(session, &run_call_ids).await;
                return Ok(RunOutcome::Answer {
                    text: completion.text,
                    iterations: iteration,
                });
            }

            let calls = unique_call_ids(session, completion.tool_calls);
            debug!(session_id = %session.id, iteration, tool_count = calls.len(), "Executing tool calls");
            for call in &calls {
                session.tool_calls.issue(&call.id, &call.name, call.arguments.clone());
                run_call_ids.push(call.id.clone());
            }
            self.store
                .append(session, Message::assistant_with_calls(completion.text.clone(), calls.clone()))
                .await?;

            let skip_all = iteration == max_iterations && self.settings.cap_policy == IterationCapPolicy::SkipRemaining;
            for (index, call) in calls.iter().enumerate() {
                if cancel.is_cancelled() {
                    for skipped in &calls[index..] {
                        self.resolve(session, skipped, Resolution::failed(CANCELLED_BEFORE_EXECUTION.into(), true, true))
                            .await?;
                    }
                    return Err(Error::Cancelled);
                }
                let resolution = if skip_all {
                    Resolution::failed(CAP_REACHED.into(), true, true)
                } else {
                    self.handle_call(session, call, cancel).await
                };
                self.resolve(session, call, resolution).await?;
            }

            self.events.publish(AgentEvent::IterationComplete {
                session_id: session.id.to_string(),
                iteration,
                tool_calls: calls.len(),
            });
            last_text = Some(completion.text).filter(|t| !t.is_empty());
        }

        warn!(
            session_id = %session.id,
            iterations = max_iterations,
            "Max iterations reached with tool calls still pending"
        );
        Ok(RunOutcome::Incomplete {
            iterations: max_iterations,
            last_text,
        })
    }

    /// One reasoning-only call with no tool schemas. A provider failure
    /// here is logged and the run continues without a plan.
    async fn think(&self, session: &mut Session, cancel: &CancellationToken) -> Result<Option<String>> {
        let system_prompt = format!("{}\n\n{THINKING_PROMPT}", self.settings.system_prompt.trim());
        let extras = PayloadExtras {
            system_prompt: Some(&system_prompt),
            ..self.store.extras()
        };
        let payload = self.store.build_payload(session, &extras);
        let request = CompletionRequest::shaped(
            payload.messages,
            Vec::new(),
            &self.provider.capabilities(),
            self.settings.temperature,
        );

        let completion = match self.complete(request, cancel).await {
            Ok(completion) => completion,
            Err(Error::Provider(e)) => {
                warn!(session_id = %session.id, error = %e, "Thinking call failed, continuing without a plan");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.store.record_usage(session, completion.usage);

        let plan = completion.text.trim().to_string();
        if plan.is_empty() {
            return Ok(None);
        }
        debug!(session_id = %session.id, plan_chars = plan.len(), "Plan produced");
        self.events.publish(AgentEvent::Thinking {
            session_id: session.id.to_string(),
            plan: plan.clone(),
        });
        Ok(Some(plan))
    }

    async fn next_completion(
        &self,
        session: &Session,
        iteration: usize,
        plan: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let tools = self.dispatcher.registry().definitions(self.mode.current());
        let extras = PayloadExtras {
            system_prompt: Some(&self.settings.system_prompt),
            plan,
            tools: &tools,
            ..self.store.extras()
        };
        let payload = self.store.build_payload(session, &extras);
        debug!(
            session_id = %session.id,
            messages = payload.messages.len(),
            tools = payload.tools.len(),
            estimated_tokens = payload.estimated_tokens,
            dropped = payload.dropped,
            "Payload built"
        );
        let request = CompletionRequest::shaped(
            payload.messages,
            payload.tools,
            &self.provider.capabilities(),
            self.settings.temperature,
        );
        self.stream_completion(&session.id.to_string(), iteration, request, cancel)
            .await
    }

    /// Stream a completion under the completion timeout, racing cancellation.
    /// Each text delta is published as it arrives.
    async fn stream_completion(
        &self,
        session_id: &str,
        iteration: usize,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let timeout_secs = self.settings.completion_timeout_secs;
        let collect = async {
            let mut chunks = self.provider.stream(request).await?;
            let mut completion = Completion::default();
            while let Some(chunk) = chunks.recv().await {
                let chunk = chunk?;
                if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                    completion.text.push_str(&text);
                    self.events.publish(AgentEvent::AssistantTextChunk {
                        session_id: session_id.to_string(),
                        iteration,
                        text,
                    });
                }
                completion.tool_calls.extend(chunk.tool_calls);
                if chunk.usage.is_some() {
                    completion.usage = chunk.usage;
                }
                if chunk.done {
                    break;
                }
            }
            Ok::<_, ProviderError>(completion)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), collect) => {
                match result {
                    Ok(Ok(completion)) => Ok(completion),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(ProviderError::Timeout(timeout_secs).into()),
                }
            }
        }
    }

    /// Call the provider under the completion timeout, racing cancellation.
    async fn complete(&self, request: CompletionRequest, cancel: &CancellationToken) -> Result<Completion> {
        let timeout_secs = self.settings.completion_timeout_secs;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), self.provider.complete(request)) => {
                match result {
                    Ok(Ok(completion)) => Ok(completion),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(ProviderError::Timeout(timeout_secs).into()),
                }
            }
        }
    }

    /// Mode check, approval, dispatch. Never fails: every path ends in a
    /// resolution the model gets to see.
    async fn handle_call(&self, session: &Session, call: &MessageToolCall, cancel: &CancellationToken) -> Resolution {
        let session_id = session.id.to_string();
        self.events.publish(AgentEvent::ToolCallProposed {
            session_id: session_id.clone(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        // Snapshot: a mode switch from here on affects the next call only.
        let mode = self.mode.current();
        let prepared = match self.dispatcher.preflight(&call.name, &call.arguments, mode) {
            Ok(prepared) => prepared,
            Err(failure) => {
                debug!(%session_id, tool = %call.name, kind = %failure.kind, "Call refused before dispatch");
                return Resolution::failed(failure.message, failure.recoverable, true);
            }
        };

        let request = ApprovalRequest {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            description: prepared.tool().description().to_string(),
            preview: prepared.preview(),
            arguments: prepared.arguments().clone(),
            primary_argument: prepared.primary_argument().map(str::to_string),
        };
        let decision = match self.gate.evaluate(&request, prepared.requires_approval()) {
            Some(decision) => decision,
            None => {
                self.events.publish(AgentEvent::ApprovalRequired {
                    session_id: session_id.clone(),
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    description: request.description.clone(),
                    preview: request.preview.clone(),
                });
                self.gate.prompt(&request, cancel).await
            }
        };
        if let ApprovalDecision::Denied { feedback } = decision {
            info!(%session_id, tool = %call.name, "Tool call denied");
            return Resolution::denied(&call.name, feedback);
        }

        match self.dispatcher.execute(prepared).await {
            Ok(output) if output.success => Resolution::succeeded(output.output),
            Ok(output) => Resolution::failed(output.output, true, false),
            Err(failure) => Resolution::failed(failure.message, failure.recoverable, false),
        }
    }

    /// Record a call's terminal outcome and append its `tool_result`.
    async fn resolve(&self, session: &mut Session, call: &MessageToolCall, resolution: Resolution) -> Result<()> {
        session.tool_calls.resolve(&call.id, resolution.outcome.clone());
        self.events.publish(AgentEvent::ToolResult {
            session_id: session.id.to_string(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome: resolution.outcome.clone(),
            output: resolution.content.clone(),
        });

        let mut message = Message::tool_result(&call.id, resolution.content)
            .with_metadata("tool_name", serde_json::json!(call.name))
            .with_metadata("outcome", serde_json::json!(resolution.outcome.label()));
        if resolution.synthetic {
            message = message.synthetic();
        }
        self.store.append(session, message).await?;
        Ok(())
    }

    /// Reflect over the calls of a successful run. Failures only cost the lesson.
    async fn learn(&self, session: &mut Session, run_call_ids: &[String]) {
        let calls: Vec<ToolCall> = run_call_ids
            .iter()
            .filter_map(|id| session.tool_calls.get(id).cloned())
            .collect();
        let Some(strategy) = self.store.reflect(&calls, true) else {
            return;
        };
        let category = strategy.category.clone();
        match self.store.record_strategy(session, strategy).await {
            Ok(id) => info!(session_id = %session.id, strategy_id = %id, %category, "Learned strategy"),
            Err(e) => warn!(session_id = %session.id, error = %e, "Failed to record strategy"),
        }
    }
}

/// Replace empty or colliding call ids with fresh ones.
fn unique_call_ids(session: &Session, calls: Vec<MessageToolCall>) -> Vec<MessageToolCall> {
    let mut seen: HashSet<String> = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            let taken = call.id.trim().is_empty() || session.tool_calls.contains(&call.id) || seen.contains(&call.id);
            if taken {
                let fresh = format!("call_{}", Uuid::new_v4().simple());
                debug!(original = %call.id, fresh = %fresh, "Reassigned tool call id");
                call.id = fresh;
            }
            seen.insert(call.id.clone());
            call
        })
        .collect()
}
