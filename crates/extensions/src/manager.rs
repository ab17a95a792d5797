//! Extension server lifecycle.
//!
//! Each server owns a slot with its own operation lock; connect and
//! disconnect on one server never wait on another. The server map itself is
//! only locked for lookups, never across an await.

use crate::tool::ExtensionTool;
use crate::transport::{Connector, ExtensionTransport};
use codeward_config::ExtensionServerConfig;
use codeward_core::{ExtensionError, Tool};
use codeward_security::{AuditEvent, AuditLogger, AuditOutcome};
use codeward_tools::{ToolRegistry, ToolSource};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Failed { reason: String },
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Disconnected => f.write_str("disconnected"),
            ServerState::Connecting => f.write_str("connecting"),
            ServerState::Connected => f.write_str("connected"),
            ServerState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub enabled: bool,
    pub state: ServerState,
    pub tools: Vec<String>,
}

struct Connection {
    state: ServerState,
    tools: Vec<String>,
    transport: Option<Arc<dyn ExtensionTransport>>,
}

struct ServerSlot {
    config: ExtensionServerConfig,
    op_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Connection>,
}

impl ServerSlot {
    fn new(config: ExtensionServerConfig) -> Self {
        Self {
            config,
            op_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(Connection {
                state: ServerState::Disconnected,
                tools: Vec::new(),
                transport: None,
            }),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ExtensionManager {
    registry: Arc<ToolRegistry>,
    connector: Arc<dyn Connector>,
    servers: RwLock<BTreeMap<String, Arc<ServerSlot>>>,
    audit: Option<Arc<AuditLogger>>,
}

impl ExtensionManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
        servers: &BTreeMap<String, ExtensionServerConfig>,
    ) -> Self {
        let servers = servers
            .iter()
            .map(|(name, config)| (name.clone(), Arc::new(ServerSlot::new(config.clone()))))
            .collect();
        Self {
            registry,
            connector,
            servers: RwLock::new(servers),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Add a server at runtime. Returns false if the name is taken.
    pub fn add_server(&self, name: &str, config: ExtensionServerConfig) -> bool {
        let mut servers = self.servers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if servers.contains_key(name) {
            return false;
        }
        servers.insert(name.to_string(), Arc::new(ServerSlot::new(config)));
        true
    }

    fn slot(&self, name: &str) -> Result<Arc<ServerSlot>, ExtensionError> {
        self.servers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ExtensionError::UnknownServer(name.to_string()))
    }

    fn slots(&self) -> Vec<(String, Arc<ServerSlot>)> {
        self.servers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect()
    }

    /// Connect a server and register its tools. Returns the registered names.
    /// Connecting an already connected server is a no-op.
    pub async fn connect(&self, name: &str) -> Result<Vec<String>, ExtensionError> {
        let slot = self.slot(name)?;
        if !slot.config.enabled {
            return Err(ExtensionError::InvalidState {
                server: name.to_string(),
                state: "disabled".into(),
            });
        }
        let _op = slot.op_lock.lock().await;
        {
            let mut conn = slot.connection();
            if conn.state == ServerState::Connected {
                return Ok(conn.tools.clone());
            }
            conn.state = ServerState::Connecting;
        }
        info!(server = name, "Connecting extension server");

        match self.establish(name, &slot.config).await {
            Ok((transport, tools)) => {
                let mut conn = slot.connection();
                conn.state = ServerState::Connected;
                conn.tools = tools.clone();
                conn.transport = Some(transport);
                drop(conn);
                info!(server = name, tools = tools.len(), "Extension server connected");
                self.record(name, AuditOutcome::Success, format!("connected, {} tools", tools.len()));
                Ok(tools)
            }
            Err(e) => {
                let mut conn = slot.connection();
                conn.state = ServerState::Failed { reason: e.to_string() };
                conn.tools.clear();
                conn.transport = None;
                drop(conn);
                warn!(server = name, error = %e, "Extension server failed to connect");
                self.record(name, AuditOutcome::Failure, e.to_string());
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        name: &str,
        config: &ExtensionServerConfig,
    ) -> Result<(Arc<dyn ExtensionTransport>, Vec<String>), ExtensionError> {
        let transport = self.connector.open(name, config).await?;
        let registered = async {
            let discovered = transport.discover().await?;
            let timeout = Duration::from_millis(config.call_timeout_ms);
            let tools: Vec<Arc<dyn Tool>> = discovered
                .into_iter()
                .map(|d| Arc::new(ExtensionTool::new(name, d, transport.clone(), timeout)) as Arc<dyn Tool>)
                .collect();
            self.registry
                .register_many(ToolSource::Extension(name.to_string()), tools)
                .map_err(|e| ExtensionError::Protocol {
                    server: name.to_string(),
                    reason: e.to_string(),
                })
        }
        .await;

        match registered {
            Ok(names) => Ok((transport, names)),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    /// Deregister a server's tools, then close its transport.
    pub async fn disconnect(&self, name: &str) -> Result<Vec<String>, ExtensionError> {
        let slot = self.slot(name)?;
        let _op = slot.op_lock.lock().await;

        let mut removed = self.registry.deregister_source(&ToolSource::Extension(name.to_string()));
        removed.sort();
        let transport = {
            let mut conn = slot.connection();
            conn.state = ServerState::Disconnected;
            conn.tools.clear();
            conn.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
            info!(server = name, tools = removed.len(), "Extension server disconnected");
            self.record(name, AuditOutcome::Success, "disconnected".into());
        }
        Ok(removed)
    }

    pub async fn reconnect(&self, name: &str) -> Result<Vec<String>, ExtensionError> {
        self.disconnect(name).await?;
        self.connect(name).await
    }

    /// Connect every enabled server concurrently.
    pub async fn connect_all(&self) -> Vec<(String, Result<Vec<String>, ExtensionError>)> {
        let names: Vec<String> = self
            .slots()
            .into_iter()
            .filter(|(_, slot)| slot.config.enabled)
            .map(|(name, _)| name)
            .collect();
        futures::future::join_all(names.into_iter().map(|name| async move {
            let result = self.connect(&name).await;
            (name, result)
        }))
        .await
    }

    /// Disconnect everything that holds a transport.
    pub async fn shutdown(&self) {
        for (name, slot) in self.slots() {
            let connected = slot.connection().transport.is_some();
            if connected && let Err(e) = self.disconnect(&name).await {
                warn!(server = %name, error = %e, "Extension shutdown failed");
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.slot(name).ok().map(|slot| slot.connection().state.clone())
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.slots()
            .into_iter()
            .map(|(name, slot)| {
                let conn = slot.connection();
                ServerStatus {
                    name,
                    enabled: slot.config.enabled,
                    state: conn.state.clone(),
                    tools: conn.tools.clone(),
                }
            })
            .collect()
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.status()
            .into_iter()
            .filter(|s| s.state == ServerState::Connected)
            .map(|s| s.name)
            .collect()
    }

    fn record(&self, server: &str, outcome: AuditOutcome, details: String) {
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEvent::ExtensionState {
                    server: server.to_string(),
                },
                "extension_manager",
                server,
                outcome,
                Some(details),
            );
        }
    }
}
