//! End-to-end runs through a fully wired runtime with a scripted provider.

use async_trait::async_trait;
use codeward_agent::testing::{ScriptedProvider, answer, call, calls};
use codeward_agent::{RunOutcome, Runtime};
use codeward_config::{AppConfig, IterationCapPolicy, RuleConfig};
use codeward_core::{
    AgentEvent, Completion, Error, MessageToolCall, OperatingMode, ProviderError, Role, Session, Tool, ToolError,
    ToolOutcome, ToolOutput,
};
use codeward_security::{Approver, AutoApprover, DenyAllApprover};
use codeward_session::{FallbackSummarizer, InMemoryPersistence, token};
use serde_json::json;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: tempfile::TempDir,
    workspace: PathBuf,
    config: AppConfig,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("ws");
    std::fs::create_dir_all(workspace.join("src")).unwrap();
    std::fs::write(workspace.join("README.md"), "# Demo\nA small demo project for testing.\n").unwrap();
    std::fs::write(workspace.join("src/main.rs"), "fn main() {}\n").unwrap();

    let mut config = AppConfig::default();
    config.storage.session_dir = dir.path().join("state").join("sessions");
    Fixture {
        workspace,
        config,
        _dir: dir,
    }
}

fn build(fx: &Fixture, config: AppConfig, provider: Arc<ScriptedProvider>, approver: Arc<dyn Approver>) -> Runtime {
    Runtime::builder(config, provider)
        .workspace(&fx.workspace)
        .approver(approver)
        .persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<Arc<AgentEvent>>) -> Vec<Arc<AgentEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[Arc<AgentEvent>]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

/// Every issued call is terminal and has exactly one tool_result message.
fn assert_ledger_settled(session: &Session) {
    assert_eq!(session.tool_calls.pending().count(), 0);
    for call in session.tool_calls.iter() {
        let results = session
            .messages
            .iter()
            .filter(|m| m.role == Role::ToolResult && m.tool_call_id.as_deref() == Some(call.id.as_str()))
            .count();
        assert_eq!(results, 1, "call {} should have one result", call.id);
    }
}

fn outcome_of<'a>(session: &'a Session, id: &str) -> &'a ToolOutcome {
    &session.tool_calls.get(id).unwrap().outcome
}

#[tokio::test]
async fn list_files_then_read_readme() {
    let fx = fixture();
    let provider = Arc::new(ScriptedProvider::replies(vec![
        call("l1", "list_files", json!({"path": "."})),
        call("r1", "read_file", json!({"path": "README.md"})),
        answer("The README describes a small demo project."),
    ]));
    // Read-only tools must never reach the approver.
    let rt = build(&fx, fx.config.clone(), provider.clone(), Arc::new(DenyAllApprover::new("no")));
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    let outcome = rt
        .run(&mut session, "List the files, then read the README.", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text(), Some("The README describes a small demo project."));
    assert_eq!(outcome.iterations(), 3);
    assert!(outcome_of(&session, "l1").is_success());
    assert!(outcome_of(&session, "r1").is_success());
    assert_ledger_settled(&session);

    let listing = session.messages.iter().find(|m| m.tool_call_id.as_deref() == Some("l1")).unwrap();
    assert!(listing.content.contains("README.md"));
    let readme = session.messages.iter().find(|m| m.tool_call_id.as_deref() == Some("r1")).unwrap();
    assert!(readme.content.contains("small demo project"));

    let events = drain(&mut rx);
    let tool_flow: Vec<&str> = kinds(&events)
        .into_iter()
        .filter(|k| matches!(*k, "tool_call_proposed" | "tool_result" | "iteration_complete"))
        .collect();
    assert_eq!(
        tool_flow,
        vec![
            "tool_call_proposed",
            "tool_result",
            "iteration_complete",
            "tool_call_proposed",
            "tool_result",
            "iteration_complete",
            "iteration_complete",
        ]
    );
    assert!(!kinds(&events).contains(&"approval_required"));
    assert_eq!(kinds(&events).last(), Some(&"run_finished"));

    // user, (assistant + result) x2, answer
    assert_eq!(session.messages.len(), 6);
    assert_eq!(session.tokens.prompt_tokens, 50);

    // list → read is worth remembering.
    assert!(session.strategies.iter().any(|s| s.category == "list_before_read"));
    let next = rt.new_session().await.unwrap();
    assert!(next.strategies.iter().any(|s| s.category == "list_before_read"));
}

#[tokio::test]
async fn plan_mode_refuses_write_and_model_retries_read_only() {
    let fx = fixture();
    let provider = Arc::new(ScriptedProvider::replies(vec![
        call("w1", "write_file", json!({"path": "NOTES.md", "content": "plan"})),
        call("r1", "read_file", json!({"path": "README.md"})),
        answer("Here is the plan, based on the README."),
    ]));
    let rt = build(&fx, fx.config.clone(), provider.clone(), Arc::new(AutoApprover));
    rt.set_mode(OperatingMode::Plan);
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    let outcome = rt
        .run(&mut session, "Write a plan into NOTES.md", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_answer());

    match outcome_of(&session, "w1") {
        ToolOutcome::Failed { message, recoverable } => {
            assert!(message.contains("not permitted"));
            assert!(*recoverable);
        }
        other => panic!("expected a failed write, got {other:?}"),
    }
    assert!(outcome_of(&session, "r1").is_success());
    assert!(!fx.workspace.join("NOTES.md").exists());

    let refusal = session.messages.iter().find(|m| m.tool_call_id.as_deref() == Some("w1")).unwrap();
    assert!(refusal.is_synthetic());

    // The model saw the refusal before retrying.
    let second = &provider.requests()[1];
    assert!(second.messages.iter().any(|m| m.tool_call_id.as_deref() == Some("w1")));
    assert!(second.tools.iter().all(|t| t.name != "write_file"));

    // Refused calls never ask for approval.
    assert!(!kinds(&drain(&mut rx)).contains(&"approval_required"));
    assert_ledger_settled(&session);
}

/// Records each execution so a test can see what actually ran.
struct RecordingTool {
    name: &'static str,
    read_only: bool,
    ran: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Records that it ran"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.ran.lock().unwrap().push(self.name.to_string());
        Ok(ToolOutput::ok("done"))
    }
}

#[tokio::test]
async fn plan_mode_never_dispatches_side_effecting_tools() {
    const TOOLS: [(&str, bool); 5] = [
        ("scan_a", true),
        ("scan_b", true),
        ("patch_a", false),
        ("patch_b", false),
        ("write_file", false),
    ];
    const ROUNDS: usize = 24;

    let fx = fixture();
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut rng = StdRng::seed_from_u64(0x0c0d_e3a7);

    let mut rounds: Vec<(OperatingMode, Vec<MessageToolCall>)> = Vec::new();
    let mut script = Vec::new();
    for round in 0..ROUNDS {
        let mode = if rng.random_bool(0.5) {
            OperatingMode::Plan
        } else {
            OperatingMode::Normal
        };
        let mut picks = TOOLS.to_vec();
        picks.shuffle(&mut rng);
        picks.truncate(rng.random_range(1..=TOOLS.len()));
        let batch: Vec<MessageToolCall> = picks
            .iter()
            .enumerate()
            .map(|(i, (name, _))| {
                let arguments = if *name == "write_file" {
                    json!({"path": format!("out_{round}.txt"), "content": "x"})
                } else {
                    json!({})
                };
                MessageToolCall::new(format!("r{round}c{i}"), *name, arguments)
            })
            .collect();
        script.push(Completion::with_tool_calls("", batch.clone()));
        script.push(answer("done"));
        rounds.push((mode, batch));
    }

    let mut builder = Runtime::builder(fx.config.clone(), Arc::new(ScriptedProvider::replies(script)))
        .workspace(&fx.workspace)
        .approver(Arc::new(AutoApprover))
        .persistence(Arc::new(InMemoryPersistence::new()));
    for &(name, read_only) in TOOLS.iter().filter(|(name, _)| *name != "write_file") {
        builder = builder.tool(Arc::new(RecordingTool {
            name,
            read_only,
            ran: ran.clone(),
        }));
    }
    let rt = builder.build().unwrap();
    let mut session = rt.new_session().await.unwrap();
    let read_only = |name: &str| TOOLS.iter().any(|(n, ro)| *n == name && *ro);

    for (round, (mode, batch)) in rounds.iter().enumerate() {
        rt.set_mode(*mode);
        let before = ran.lock().unwrap().len();
        rt.run(&mut session, &format!("round {round}"), &CancellationToken::new())
            .await
            .unwrap();
        let executed: Vec<String> = ran.lock().unwrap()[before..].to_vec();

        for call in batch {
            let refused = *mode == OperatingMode::Plan && !read_only(&call.name);
            match outcome_of(&session, &call.id) {
                ToolOutcome::Failed { message, .. } if refused => {
                    assert!(message.contains("not permitted"), "{} in {mode}", call.name)
                }
                ToolOutcome::Succeeded if !refused => {}
                other => panic!("{} in {mode}: unexpected {other:?}", call.name),
            }
        }
        if *mode == OperatingMode::Plan {
            assert!(executed.iter().all(|name| read_only(name)), "round {round} ran {executed:?}");
        }
        let written = fx.workspace.join(format!("out_{round}.txt")).exists();
        let asked_to_write = batch.iter().any(|c| c.name == "write_file");
        assert_eq!(written, asked_to_write && *mode == OperatingMode::Normal, "round {round}");
    }
    assert_ledger_settled(&session);
}

#[tokio::test]
async fn missing_credential_leaves_only_the_user_message() {
    let fx = fixture();
    let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::MissingCredential {
        provider: "anthropic".into(),
        env_var: "ANTHROPIC_API_KEY".into(),
    })]));
    let rt = build(&fx, fx.config.clone(), provider, Arc::new(AutoApprover));
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    let err = rt
        .run(&mut session, "Refactor main.rs", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provider(ProviderError::MissingCredential { .. })));
    let envelope = err.envelope();
    assert!(envelope.message.contains("ANTHROPIC_API_KEY"));
    assert_eq!(envelope.kind, "provider_error");

    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].content, "Refactor main.rs");
    assert!(session.tool_calls.is_empty());
    let stored = rt.resume_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1);

    let events = drain(&mut rx);
    let error = events.iter().find(|e| e.kind() == "error").unwrap();
    match error.as_ref() {
        AgentEvent::Error { error, .. } => assert!(error.message.contains("ANTHROPIC_API_KEY")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn glob_rule_skips_prompt_only_for_matching_paths() {
    let fx = fixture();
    std::fs::write(fx.workspace.join("x.tmp"), "scratch").unwrap();
    std::fs::write(fx.workspace.join("x.py"), "print('keep')").unwrap();

    let mut config = fx.config.clone();
    config.approval.rules.push(RuleConfig {
        tool: "delete_file".into(),
        kind: "glob".into(),
        argument: None,
        pattern: Some("*.tmp".into()),
    });
    let provider = Arc::new(ScriptedProvider::replies(vec![
        calls(
            "Cleaning up.",
            vec![
                ("d1", "delete_file", json!({"path": "x.tmp"})),
                ("d2", "delete_file", json!({"path": "x.py"})),
            ],
        ),
        answer("Removed the temp file; kept x.py as asked."),
    ]));
    let rt = build(&fx, config, provider, Arc::new(DenyAllApprover::new("keep python sources")));
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    rt.run(&mut session, "Delete x.tmp and x.py", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!fx.workspace.join("x.tmp").exists());
    assert!(fx.workspace.join("x.py").exists());
    assert!(outcome_of(&session, "d1").is_success());
    assert_eq!(
        outcome_of(&session, "d2"),
        &ToolOutcome::Denied {
            feedback: "keep python sources".into()
        }
    );
    let denial = session.messages.iter().find(|m| m.tool_call_id.as_deref() == Some("d2")).unwrap();
    assert!(denial.content.contains("keep python sources"));

    let prompts: Vec<String> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e.as_ref() {
            AgentEvent::ApprovalRequired { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec!["d2".to_string()]);
    assert_ledger_settled(&session);
}

/// Cancels the run's token when executed.
struct CancellingTool {
    cancel: CancellationToken,
}

#[async_trait]
impl Tool for CancellingTool {
    fn name(&self) -> &str {
        "inspect"
    }

    fn description(&self) -> &str {
        "Inspects the workspace"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.cancel.cancel();
        Ok(ToolOutput::ok("inspected"))
    }
}

#[tokio::test]
async fn cancellation_skips_undispatched_calls_and_session_resumes() {
    let fx = fixture();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::replies(vec![
        calls(
            "",
            vec![
                ("i1", "inspect", json!({})),
                ("l1", "list_files", json!({"path": "."})),
                ("r1", "read_file", json!({"path": "README.md"})),
            ],
        ),
        answer("Picking up where we left off."),
    ]));
    let rt = Runtime::builder(fx.config.clone(), provider.clone())
        .workspace(&fx.workspace)
        .approver(Arc::new(AutoApprover))
        .persistence(Arc::new(InMemoryPersistence::new()))
        .tool(Arc::new(CancellingTool { cancel: cancel.clone() }))
        .build()
        .unwrap();
    let mut session = rt.new_session().await.unwrap();

    let err = rt.run(&mut session, "Inspect everything", &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!err.is_failure());

    // Already dispatched: finished naturally. The rest: skipped.
    assert!(outcome_of(&session, "i1").is_success());
    for id in ["l1", "r1"] {
        match outcome_of(&session, id) {
            ToolOutcome::Failed { message, .. } => assert_eq!(message, "cancelled before execution"),
            other => panic!("expected {id} to be skipped, got {other:?}"),
        }
    }
    assert_ledger_settled(&session);

    let mut resumed = rt.resume_session(&session.id).await.unwrap();
    assert_eq!(resumed.messages.len(), session.messages.len());
    let outcome = rt
        .run(&mut resumed, "Carry on", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_answer());
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn iteration_cap_finishes_in_flight_calls_then_stops_incomplete() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.agent.max_iterations = 2;
    let provider = Arc::new(ScriptedProvider::replies(vec![
        call("l1", "list_files", json!({"path": "."})),
        call("l2", "list_files", json!({"path": "src"})),
        answer("never reached"),
    ]));
    let rt = build(&fx, config, provider.clone(), Arc::new(AutoApprover));
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    let outcome = rt
        .run(&mut session, "Explore forever", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Incomplete {
            iterations: 2,
            last_text: None
        }
    );
    assert!(outcome_of(&session, "l2").is_success());
    assert_eq!(provider.call_count(), 2);
    assert_ledger_settled(&session);

    let finished = drain(&mut rx).into_iter().find(|e| e.kind() == "run_finished").unwrap();
    assert!(matches!(
        finished.as_ref(),
        AgentEvent::RunFinished { incomplete: true, iterations: 2, .. }
    ));
    // An unfinished run teaches nothing.
    assert!(session.strategies.is_empty());
}

#[tokio::test]
async fn iteration_cap_can_skip_the_final_calls() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.agent.max_iterations = 1;
    config.agent.cap_policy = IterationCapPolicy::SkipRemaining;
    let provider = Arc::new(ScriptedProvider::replies(vec![call("l1", "list_files", json!({"path": "."}))]));
    let rt = build(&fx, config, provider, Arc::new(AutoApprover));
    let mut session = rt.new_session().await.unwrap();

    let outcome = rt
        .run(&mut session, "Look", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!outcome.is_answer());
    assert!(matches!(outcome_of(&session, "l1"), ToolOutcome::Failed { .. }));
    assert_ledger_settled(&session);
}

#[tokio::test]
async fn concurrent_run_on_same_session_is_rejected() {
    let fx = fixture();
    let provider = Arc::new(
        ScriptedProvider::replies(vec![answer("first done"), answer("second done")])
            .with_delay(Duration::from_millis(50)),
    );
    let rt = build(&fx, fx.config.clone(), provider.clone(), Arc::new(AutoApprover));
    let mut first = rt.new_session().await.unwrap();
    let mut second = first.clone();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        rt.run(&mut first, "first request", &cancel),
        rt.run(&mut second, "second request", &cancel)
    );

    assert!(a.unwrap().is_answer());
    let err = b.unwrap_err();
    assert!(matches!(err, Error::SessionBusy(_)));
    assert!(err.envelope().recoverable);
    assert!(second.messages.is_empty());
    assert_eq!(provider.call_count(), 1);

    // Once the first run is done the session is free again.
    rt.run(&mut first, "follow-up", &cancel).await.unwrap();
}

#[tokio::test]
async fn long_sessions_compact_and_keep_the_latest_request() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.context.token_budget = 400;
    config.context.compaction_threshold = 0.5;
    // The summarizer shares the provider, so replies are interchangeable.
    let script = (0..20).map(|i| answer(&format!("reply {i} {}", "r".repeat(200)))).collect();
    let provider = Arc::new(ScriptedProvider::replies(script));
    let rt = build(&fx, config, provider, Arc::new(AutoApprover));
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    for i in 0..6 {
        rt.run(&mut session, &format!("question {i} {}", "q".repeat(200)), &CancellationToken::new())
            .await
            .unwrap();
    }
    rt.run(&mut session, "the last question", &CancellationToken::new())
        .await
        .unwrap();

    assert!(kinds(&drain(&mut rx)).contains(&"compacted"));
    assert!(session.tokens.compactions >= 1);
    assert!(session.messages[0].content.starts_with("[CONVERSATION SUMMARY]"));
    assert!(session.messages[0].is_synthetic());
    assert_eq!(session.latest_user_message().unwrap().content, "the last question");
    assert_eq!(session.messages.last().unwrap().role, Role::Assistant);

    let stored = rt.resume_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), session.messages.len());
}

#[tokio::test]
async fn one_long_request_stays_within_budget_across_compactions() {
    let fx = fixture();
    let chunk: String = (0..100).map(|i| format!("line {i:03} {}\n", "b".repeat(50))).collect();
    std::fs::write(fx.workspace.join("big.txt"), &chunk).unwrap();

    let mut config = fx.config.clone();
    config.agent.system_prompt = "You are a coding assistant.".into();
    config.agent.max_iterations = 12;
    config.context.token_budget = 4000;
    config.context.compaction_threshold = 0.5;

    let mut script: Vec<Completion> = (0..8)
        .map(|i| call(&format!("b{i}"), "read_file", json!({"path": "big.txt"})))
        .collect();
    script.push(answer("Read it eight times; the file is stable."));
    let provider = Arc::new(ScriptedProvider::replies(script));
    let rt = Runtime::builder(config, provider.clone())
        .workspace(&fx.workspace)
        .approver(Arc::new(AutoApprover))
        .persistence(Arc::new(InMemoryPersistence::new()))
        .summarizer(Arc::new(FallbackSummarizer))
        .build()
        .unwrap();
    let mut rx = rt.subscribe();
    let mut session = rt.new_session().await.unwrap();

    let outcome = rt
        .run(&mut session, "Read big.txt repeatedly", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_answer());

    for (i, request) in provider.requests().iter().enumerate() {
        let used = token::estimate_messages_tokens(&request.messages) + token::estimate_tools_tokens(&request.tools);
        assert!(used <= 4000, "request {i} used {used} tokens");
        let user = request.messages.iter().filter(|m| m.role == Role::User).last().unwrap();
        assert_eq!(user.content, "Read big.txt repeatedly");
        assert_ne!(request.messages.iter().find(|m| m.role != Role::System).unwrap().role, Role::ToolResult);
    }

    let compactions = kinds(&drain(&mut rx)).iter().filter(|k| **k == "compacted").count();
    assert!(compactions >= 2, "compacted {compactions} times");
    assert_eq!(session.tokens.compactions as usize, compactions);
    assert_eq!(session.messages[0].content, "Read big.txt repeatedly");
    assert_eq!(session.messages.iter().filter(|m| m.is_synthetic() && m.role == Role::System).count(), 1);
    assert_eq!(session.tool_calls.pending().count(), 0);
    assert_eq!(session.tool_calls.len(), 8);
}
