//! Mode controller.
//!
//! Holds the current operating mode. Checks read a snapshot, so switching
//! modes affects the next check and never an in-flight dispatch.

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use codeward_core::{OperatingMode, Tool};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const NORMAL: u8 = 0;
const PLAN: u8 = 1;

pub struct ModeController {
    mode: AtomicU8,
    audit: Option<Arc<AuditLogger>>,
}

impl ModeController {
    pub fn new(initial: OperatingMode) -> Self {
        Self {
            mode: AtomicU8::new(encode(initial)),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn current(&self) -> OperatingMode {
        match self.mode.load(Ordering::SeqCst) {
            PLAN => OperatingMode::Plan,
            _ => OperatingMode::Normal,
        }
    }

    /// Switch modes. Returns the previous mode.
    pub fn set(&self, mode: OperatingMode) -> OperatingMode {
        let previous = self.mode.swap(encode(mode), Ordering::SeqCst);
        let previous = if previous == PLAN {
            OperatingMode::Plan
        } else {
            OperatingMode::Normal
        };
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "Operating mode changed");
            if let Some(audit) = &self.audit {
                audit.log(
                    AuditEvent::ModeChange {
                        mode: mode.to_string(),
                    },
                    "user",
                    "runtime",
                    AuditOutcome::Success,
                    None,
                );
            }
        }
        previous
    }

    /// Whether a tool with this read-only tag may run under the current mode.
    pub fn allowed(&self, read_only: bool) -> bool {
        self.current().permits(read_only)
    }

    pub fn allows_tool(&self, tool: &dyn Tool) -> bool {
        self.allowed(tool.read_only())
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(OperatingMode::Normal)
    }
}

fn encode(mode: OperatingMode) -> u8 {
    match mode {
        OperatingMode::Normal => NORMAL,
        OperatingMode::Plan => PLAN,
    }
}
