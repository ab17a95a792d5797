//! JSON-RPC over a child process's stdin/stdout, one message per line.
//!
//! Requests are matched to responses by id through a pending-waiter map fed
//! by a background reader task, so concurrent calls on one server don't
//! serialize behind each other.

use crate::protocol::{
    CallToolResult, DiscoveredTool, JsonRpcMessage, JsonRpcRequest, ToolsListResult, initialize_params,
};
use crate::transport::{Connector, ExtensionTransport};
use async_trait::async_trait;
use codeward_config::ExtensionServerConfig;
use codeward_core::{ExtensionError, ToolOutput};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

/// Discovery pages beyond this are ignored.
const MAX_LIST_PAGES: usize = 32;

pub struct StdioTransport {
    server: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    waiters: Waiters,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcMessage>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StdioTransport {
    /// Start the server process. No handshake is performed.
    pub fn spawn(server: &str, config: &ExtensionServerConfig) -> Result<Self, ExtensionError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| ExtensionError::Spawn {
            server: server.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExtensionError::Spawn {
                server: server.to_string(),
                reason: "child stdio was not captured".into(),
            });
        };

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            server.to_string(),
            stdout,
            waiters.clone(),
            closed.clone(),
        ));

        Ok(Self {
            server: server.to_string(),
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            waiters,
            next_id: AtomicU64::new(1),
            closed,
            request_timeout: Duration::from_millis(config.call_timeout_ms),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    pub async fn initialize(&self) -> Result<(), ExtensionError> {
        let result = self
            .request("initialize", Some(initialize_params()))
            .await
            .map_err(|e| ExtensionError::Handshake {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;
        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(server = %self.server, remote = server_name, "Extension handshake complete");
        self.send(&JsonRpcRequest::notification("notifications/initialized", None))
            .await
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<(), ExtensionError> {
        let mut line = serde_json::to_string(message).map_err(|e| self.protocol(e.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport(e.to_string()))?;
        stdin.flush().await.map_err(|e| self.transport(e.to_string()))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ExtensionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            // The reader marks the transport closed before clearing waiters,
            // so a waiter inserted under this lock is either cleared or refused.
            let mut waiters = lock(&self.waiters);
            if self.closed.load(Ordering::SeqCst) {
                return Err(ExtensionError::Closed(self.server.clone()));
            }
            waiters.insert(id, tx);
        }

        if let Err(e) = self.send(&JsonRpcRequest::new(id, method, params)).await {
            lock(&self.waiters).remove(&id);
            return Err(e);
        }

        let message = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => return Err(self.transport(format!("connection closed during {method}"))),
            Err(_) => {
                lock(&self.waiters).remove(&id);
                return Err(ExtensionError::Timeout {
                    server: self.server.clone(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                });
            }
        };

        if let Some(error) = message.error {
            return Err(self.protocol(format!("{} (code {})", error.message, error.code)));
        }
        Ok(message.result.unwrap_or(Value::Null))
    }

    fn protocol(&self, reason: String) -> ExtensionError {
        ExtensionError::Protocol {
            server: self.server.clone(),
            reason,
        }
    }

    fn transport(&self, reason: String) -> ExtensionError {
        ExtensionError::Transport {
            server: self.server.clone(),
            reason,
        }
    }
}

async fn read_loop(server: String, stdout: ChildStdout, waiters: Waiters, closed: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let message: JsonRpcMessage = match serde_json::from_str(line) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(server = %server, error = %e, "Ignoring non-JSON line from extension");
                        continue;
                    }
                };
                match message.response_id() {
                    Some(id) => match lock(&waiters).remove(&id) {
                        Some(waiter) => {
                            let _ = waiter.send(message);
                        }
                        None => warn!(server = %server, id, "Response for unknown request id"),
                    },
                    None => debug!(server = %server, method = ?message.method, "Extension notification"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, error = %e, "Extension stdout read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every pending caller with an error.
    lock(&waiters).clear();
    info!(server = %server, "Extension output closed");
}

#[async_trait]
impl ExtensionTransport for StdioTransport {
    async fn discover(&self) -> Result<Vec<DiscoveredTool>, ExtensionError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }))
                .or_else(|| Some(serde_json::json!({})));
            let result = self.request("tools/list", params).await?;
            let page: ToolsListResult =
                serde_json::from_value(result).map_err(|e| self.protocol(format!("bad tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ExtensionError> {
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": tool, "arguments": arguments })),
            )
            .await?;
        let result: CallToolResult =
            serde_json::from_value(result).map_err(|e| self.protocol(format!("bad tools/call result: {e}")))?;
        Ok(result.into_output())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!(server = %self.server, error = %e, "Extension process already gone");
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        lock(&self.waiters).clear();
    }
}

/// Opens [`StdioTransport`]s and runs the handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

#[async_trait]
impl Connector for StdioConnector {
    async fn open(
        &self,
        server: &str,
        config: &ExtensionServerConfig,
    ) -> Result<Arc<dyn ExtensionTransport>, ExtensionError> {
        let transport = StdioTransport::spawn(server, config)?;
        if let Err(e) = transport.initialize().await {
            transport.close().await;
            return Err(e);
        }
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = ExtensionServerConfig::new("codeward-definitely-not-a-binary");
        let err = StdioConnector.open("ghost", &config).await.err().unwrap();
        assert!(matches!(err, ExtensionError::Spawn { ref server, .. } if server == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_exiting_fails_the_handshake() {
        let mut config = ExtensionServerConfig::new("sh");
        config.args = vec!["-c".into(), "exit 0".into()];
        let err = StdioConnector.open("quitter", &config).await.err().unwrap();
        assert!(matches!(err, ExtensionError::Handshake { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn requests_after_exit_fail_fast() {
        let mut config = ExtensionServerConfig::new("sh");
        config.args = vec!["-c".into(), "exit 0".into()];
        config.call_timeout_ms = 60_000;
        let transport = StdioTransport::spawn("quitter", &config).unwrap();

        for _ in 0..200 {
            if transport.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.closed.load(Ordering::SeqCst));

        let started = std::time::Instant::now();
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Closed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lock(&transport.waiters).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scripted_server_round_trip() {
        // Answers initialize, tools/list and tools/call in order, by request id 1, 2, 3.
        let script = r#"
read _; echo '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fake"}}}'
read _
read _; echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
read _; echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
"#;
        let mut config = ExtensionServerConfig::new("sh");
        config.args = vec!["-c".into(), script.into()];
        let transport = StdioConnector.open("fake", &config).await.unwrap();

        let tools = transport.discover().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let out = transport.invoke("echo", serde_json::json!({})).await.unwrap();
        assert_eq!(out.output, "pong");

        transport.close().await;
        let err = transport.invoke("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Closed(_)));
    }
}
