//! The top-level runtime context.
//!
//! A [`Runtime`] owns one instance of every component: tool registry and
//! dispatcher, approval gate, mode controller, extension manager, session
//! store and event bus. Nothing is global; two runtimes in one process are
//! fully independent.
//!
//! Runs are serialized per session: a second `run` on a session that already
//! has one in flight fails fast with [`Error::SessionBusy`] instead of
//! interleaving iterations.

use crate::orchestrator::{Orchestrator, RunOutcome};
use codeward_config::AppConfig;
use codeward_core::{
    AgentEvent, CompletionProvider, Error, EventBus, OperatingMode, Result, Session, SessionId, Tool,
};
use codeward_extensions::{Connector, ExtensionManager, StdioConnector};
use codeward_security::{
    ApprovalGate, ApprovalRule, Approver, AuditLogger, DenyAllApprover, ModeController, RuleTable,
};
use codeward_session::{
    FilePersistence, ProviderSummarizer, SessionPersistence, SessionStore, SessionSummary, Summarizer,
};
use codeward_tools::{Dispatcher, ToolRegistry, ToolSource};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RULES_FILE: &str = "approval_rules.json";

/// Assembles a [`Runtime`] from configuration plus the collaborators the
/// core doesn't own (provider, approver, persistence, extension connector).
pub struct RuntimeBuilder {
    config: AppConfig,
    provider: Arc<dyn CompletionProvider>,
    workspace: PathBuf,
    approver: Option<Arc<dyn Approver>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    connector: Option<Arc<dyn Connector>>,
    rules: Option<Arc<RuleTable>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    tools: Vec<Arc<dyn Tool>>,
    events: Option<EventBus>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            config,
            provider,
            workspace: PathBuf::from("."),
            approver: None,
            persistence: None,
            connector: None,
            rules: None,
            summarizer: None,
            tools: Vec::new(),
            events: None,
        }
    }

    /// Root directory the built-in file and shell tools operate in.
    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn rules(mut self, rules: Arc<RuleTable>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Summarizer used for compaction. Defaults to one backed by the provider.
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Register an additional built-in tool.
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate().map_err(|e| Error::Config { message: e.to_string() })?;
        let config = self.config;
        let audit = Arc::new(AuditLogger::traced());

        let registry = codeward_tools::default_registry(&self.workspace, &config.tools)
            .map_err(|e| Error::Config { message: e.to_string() })?;
        if !self.tools.is_empty() {
            registry
                .register_many(ToolSource::Builtin, self.tools)
                .map_err(|e| Error::Config { message: e.to_string() })?;
        }
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::from_settings(registry.clone(), &config.tools).with_audit(audit.clone()));

        let rules = self.rules.unwrap_or_else(|| {
            Arc::new(RuleTable::load(config.storage.session_dir.with_file_name(RULES_FILE)))
        });
        for rule_config in &config.approval.rules {
            let rule = ApprovalRule::from_config(rule_config).map_err(|e| Error::Config { message: e.to_string() })?;
            rules.install(rule).map_err(|e| Error::Config { message: e.to_string() })?;
        }
        let approver = self.approver.unwrap_or_else(|| {
            Arc::new(DenyAllApprover::new("No approver is configured; the operation was not run."))
        });
        let gate = Arc::new(
            ApprovalGate::new(rules, approver, audit.clone()).with_auto_approve_all(config.approval.auto_approve_all),
        );

        let mode = Arc::new(ModeController::new(OperatingMode::Normal).with_audit(audit.clone()));

        let connector = self.connector.unwrap_or_else(|| Arc::new(StdioConnector));
        let extensions =
            Arc::new(ExtensionManager::new(registry.clone(), connector, &config.extensions).with_audit(audit.clone()));

        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(FilePersistence::new(config.storage.session_dir.clone())));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| Arc::new(ProviderSummarizer::new(self.provider.clone())));
        let store = Arc::new(SessionStore::new(persistence, config.context.clone()).with_summarizer(summarizer));

        let events = self.events.unwrap_or_default();
        let orchestrator = Orchestrator::new(
            self.provider,
            dispatcher.clone(),
            gate.clone(),
            mode.clone(),
            store.clone(),
            events.clone(),
        )
        .with_settings(config.agent.clone());

        info!(
            tools = registry.len(),
            extensions = config.extensions.len(),
            workspace = %self.workspace.display(),
            "Runtime ready"
        );
        Ok(Runtime {
            config,
            registry,
            dispatcher,
            gate,
            mode,
            extensions,
            store,
            events,
            audit,
            orchestrator,
            locks: Mutex::new(HashMap::new()),
        })
    }
}

pub struct Runtime {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<ApprovalGate>,
    mode: Arc<ModeController>,
    extensions: Arc<ExtensionManager>,
    store: Arc<SessionStore>,
    events: EventBus,
    audit: Arc<AuditLogger>,
    orchestrator: Orchestrator,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Runtime {
    pub fn builder(config: AppConfig, provider: Arc<dyn CompletionProvider>) -> RuntimeBuilder {
        RuntimeBuilder::new(config, provider)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.events.subscribe()
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode.current()
    }

    /// Switch modes. Takes effect at the next tool call; a call already
    /// past its mode check is unaffected.
    pub fn set_mode(&self, mode: OperatingMode) -> OperatingMode {
        self.mode.set(mode)
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub async fn new_session(&self) -> Result<Session> {
        Ok(self.store.create().await?)
    }

    pub async fn resume_session(&self, id: &SessionId) -> Result<Session> {
        Ok(self.store.resume(id).await?)
    }

    pub async fn latest_session(&self) -> Result<Option<Session>> {
        Ok(self.store.latest().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.store.list().await?)
    }

    /// Delete a session. Refused while a run holds it.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let _lease = self.lease(id)?;
        Ok(self.store.delete(id).await?)
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    /// Run one user request against `session`.
    pub async fn run(&self, session: &mut Session, input: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        let _lease = self.lease(&session.id).inspect_err(|_| {
            warn!(session_id = %session.id, "Rejected concurrent run");
        })?;
        self.orchestrator.run(session, input, cancel).await
    }

    // ── Extensions ────────────────────────────────────────────────────────

    /// Connect every enabled extension server concurrently. Failures are
    /// isolated to their server and logged.
    pub async fn connect_extensions(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for (name, result) in self.extensions.connect_all().await {
            match result {
                Ok(tools) => {
                    info!(server = %name, tools = tools.len(), "Extension connected");
                    connected.push(name);
                }
                Err(e) => warn!(server = %name, error = %e, "Extension failed to connect"),
            }
        }
        connected
    }

    /// Disconnect all extension servers.
    pub async fn shutdown(&self) {
        self.extensions.shutdown().await;
        info!("Runtime shut down");
    }

    fn locks_guard(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exclusive hold on a session, or `SessionBusy` if someone has it.
    fn lease(&self, id: &SessionId) -> Result<SessionLease<'_>> {
        let lock = self.locks_guard().entry(id.clone()).or_default().clone();
        let Ok(guard) = lock.try_lock_owned() else {
            return Err(Error::SessionBusy(id.to_string()));
        };
        Ok(SessionLease {
            runtime: self,
            id: id.clone(),
            guard: Some(guard),
        })
    }

    /// Drop the session's lock entry once nothing but the map refers to it.
    fn prune_lock(&self, id: &SessionId) {
        let mut locks = self.locks_guard();
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }
}

struct SessionLease<'a> {
    runtime: &'a Runtime,
    id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.runtime.prune_lock(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProvider, answer};
    use codeward_session::InMemoryPersistence;

    fn runtime(provider: ScriptedProvider, dir: &std::path::Path) -> Runtime {
        let mut config = AppConfig::default();
        config.storage.session_dir = dir.join("sessions");
        Runtime::builder(config, Arc::new(provider))
            .workspace(dir)
            .persistence(Arc::new(InMemoryPersistence::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn builds_with_builtin_tools() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(ScriptedProvider::replies(vec![]), dir.path());
        assert!(rt.registry().contains("read_file"));
        assert!(rt.registry().contains("run_command"));
        assert_eq!(rt.mode(), OperatingMode::Normal);
        assert!(rt.extensions().status().is_empty());
    }

    #[tokio::test]
    async fn mode_switch_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(ScriptedProvider::replies(vec![]), dir.path());
        assert_eq!(rt.set_mode(OperatingMode::Plan), OperatingMode::Normal);
        assert_eq!(rt.mode(), OperatingMode::Plan);
    }

    #[tokio::test]
    async fn sessions_round_trip_through_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(ScriptedProvider::replies(vec![answer("hi there")]), dir.path());
        let mut session = rt.new_session().await.unwrap();
        rt.run(&mut session, "Say hi.", &CancellationToken::new()).await.unwrap();

        let listed = rt.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("Say hi"));

        let resumed = rt.resume_session(&session.id).await.unwrap();
        assert_eq!(resumed.messages.len(), 2);
        assert!(rt.delete_session(&session.id).await.unwrap());
        assert!(rt.latest_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_locks_are_released_after_runs() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(
            ScriptedProvider::replies(vec![answer("one"), answer("two"), answer("three")]),
            dir.path(),
        );
        for _ in 0..3 {
            let mut session = rt.new_session().await.unwrap();
            rt.run(&mut session, "hello", &CancellationToken::new()).await.unwrap();
        }
        assert!(rt.locks_guard().is_empty());

        // A held lease keeps its entry and turns a second caller away.
        let id = SessionId::new();
        let lease = rt.lease(&id).unwrap();
        assert!(matches!(rt.lease(&id), Err(Error::SessionBusy(_))));
        assert_eq!(rt.locks_guard().len(), 1);
        drop(lease);
        assert!(rt.locks_guard().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.context.token_budget = 0;
        let result = Runtime::builder(config, Arc::new(ScriptedProvider::replies(vec![]))).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
