//! Tool dispatch: the single enforcement point for mode and arguments.
//!
//! `preflight` resolves the tool, checks the mode, and validates arguments
//! without running anything, so callers can put an approval prompt between
//! the checks and `execute`. `dispatch` does both in one step. Every failure
//! comes back as a [`ToolFailure`].

use crate::registry::{RegisteredTool, ToolRegistry};
use codeward_config::ToolSettings;
use codeward_core::{OperatingMode, Tool, ToolError, ToolFailure, ToolOutput};
use codeward_security::{AuditEvent, AuditLogger, AuditOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A call that passed preflight and is ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    entry: RegisteredTool,
    arguments: serde_json::Value,
}

impl PreparedCall {
    pub fn tool(&self) -> &dyn Tool {
        self.entry.tool.as_ref()
    }

    pub fn name(&self) -> &str {
        self.entry.name()
    }

    pub fn arguments(&self) -> &serde_json::Value {
        &self.arguments
    }

    pub fn requires_approval(&self) -> bool {
        self.entry.tool.requires_approval()
    }

    pub fn preview(&self) -> String {
        self.entry.tool.preview(&self.arguments)
    }

    pub fn primary_argument(&self) -> Option<&str> {
        self.entry.validator().primary_argument()
    }
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_output_chars: usize,
    audit: Option<Arc<AuditLogger>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let defaults = ToolSettings::default();
        Self {
            registry,
            timeout: Duration::from_secs(defaults.timeout_secs),
            max_output_chars: defaults.max_output_chars,
            audit: None,
        }
    }

    pub fn from_settings(registry: Arc<ToolRegistry>, settings: &ToolSettings) -> Self {
        Self::new(registry)
            .with_timeout(Duration::from_secs(settings.timeout_secs))
            .with_max_output_chars(settings.max_output_chars)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolve, mode-check and validate a call. The handler is never invoked.
    pub fn preflight(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        mode: OperatingMode,
    ) -> Result<PreparedCall, ToolFailure> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ToolFailure::from(ToolError::NotFound(name.to_string())))?;

        if !mode.permits(entry.tool.read_only()) {
            tracing::info!(tool = name, mode = %mode, "Tool refused by operating mode");
            if let Some(audit) = &self.audit {
                audit.log(
                    AuditEvent::ModeDenied {
                        tool_name: name.to_string(),
                    },
                    mode.as_str(),
                    name,
                    AuditOutcome::Denied,
                    None,
                );
            }
            return Err(ToolError::NotPermitted {
                tool_name: name.to_string(),
                mode: mode.to_string(),
            }
            .into());
        }

        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        entry.validator().validate(&arguments).map_err(|reason| {
            ToolFailure::from(ToolError::InvalidArguments {
                tool_name: name.to_string(),
                reason,
            })
        })?;

        Ok(PreparedCall { entry, arguments })
    }

    /// Run a prepared call under the dispatch timeout.
    pub async fn execute(&self, call: PreparedCall) -> Result<ToolOutput, ToolFailure> {
        let name = call.name().to_string();
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, call.entry.tool.execute(call.arguments)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(Ok(output)) => Ok(self.truncate(output)),
            Ok(Err(e)) => Err(ToolFailure::from(e)),
            Err(_) => Err(ToolFailure::from(ToolError::Timeout {
                tool_name: name.clone(),
                timeout_secs: self.timeout.as_secs(),
            })),
        };

        match &result {
            Ok(output) => tracing::debug!(tool = %name, success = output.success, elapsed_ms, "Tool executed"),
            Err(failure) => tracing::warn!(tool = %name, kind = %failure.kind, elapsed_ms, "Tool failed: {}", failure.message),
        }
        if let Some(audit) = &self.audit {
            let outcome = match &result {
                Ok(output) if output.success => AuditOutcome::Success,
                _ => AuditOutcome::Failure,
            };
            audit.log(
                AuditEvent::ToolExecution {
                    tool_name: name.clone(),
                },
                "agent",
                &name,
                outcome,
                Some(format!("{elapsed_ms}ms")),
            );
        }
        result
    }

    /// Preflight then execute.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        mode: OperatingMode,
    ) -> Result<ToolOutput, ToolFailure> {
        let prepared = self.preflight(name, arguments, mode)?;
        self.execute(prepared).await
    }

    fn truncate(&self, mut output: ToolOutput) -> ToolOutput {
        let total = output.output.chars().count();
        if total > self.max_output_chars {
            let cut = output
                .output
                .char_indices()
                .nth(self.max_output_chars)
                .map(|(i, _)| i)
                .unwrap_or(output.output.len());
            output.output.truncate(cut);
            output
                .output
                .push_str(&format!("\n[... truncated {} chars]", total - self.max_output_chars));
        }
        output
    }
}
