//! `PluginSubprocess` manages a single plugin child process.
//!
//! Newline-delimited JSON-RPC 2.0 over stdin/stdout. A mutual handshake runs
//! immediately after spawn; a process that does not present the protocol
//! magic is killed before it ever sees an event.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::descriptor::PluginDescriptor;
use crate::protocol::{HandshakeResult, RpcNotification, RpcRequest, RpcResponse, PROTOCOL_MAGIC};
use crate::PluginError;

/// Plugin-side line length cap; a plugin emitting longer lines is broken.
const MAX_RESPONSE_LINE: usize = 4 * 1024 * 1024;

#[derive(Debug)]
struct Transport {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    process: Child,
}

/// Abstract RPC surface of one plugin.
///
/// The production implementation is [`PluginSubprocess`]; tests substitute
/// scripted channels.
#[async_trait::async_trait]
pub trait PluginChannel: Send + Sync {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, PluginError>;
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), PluginError>;
    async fn shutdown(&self) -> Result<(), PluginError>;
}

#[derive(Debug)]
pub struct PluginSubprocess {
    transport: Mutex<Transport>,
    /// Serializes request/response exchanges.
    rpc_lock: Mutex<()>,
    request_id: AtomicU64,
    timeout: Duration,
    label: String,
}

impl PluginSubprocess {
    /// Spawn the plugin binary and run the handshake.
    ///
    /// Returns the live subprocess plus the plugin's advertised identity and
    /// capabilities. The child is killed on drop if shutdown never ran.
    pub async fn spawn(
        descriptor: &PluginDescriptor,
        timeout: Duration,
    ) -> Result<(Self, HandshakeResult), PluginError> {
        let mut cmd = Command::new(&descriptor.path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Capture stderr so plugin noise cannot corrupt the proxied
            // streams.
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(PluginError::Io)?;

        if let Some(stderr) = child.stderr.take() {
            let label = descriptor.name.clone();
            tokio::spawn(async move {
                drain_plugin_stderr(label, stderr).await;
            });
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Protocol("no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Protocol("no stdout".into()))?;

        let this = Self {
            transport: Mutex::new(Transport {
                stdin,
                stdout: BufReader::new(stdout),
                process: child,
            }),
            rpc_lock: Mutex::new(()),
            request_id: AtomicU64::new(0),
            timeout,
            label: descriptor.name.clone(),
        };

        let params = serde_json::json!({
            "magic": PROTOCOL_MAGIC,
            "host_version": env!("CARGO_PKG_VERSION"),
        });
        let result = this.call("handshake", Some(params)).await?;
        let info: HandshakeResult = serde_json::from_value(result)
            .map_err(|e| PluginError::Protocol(format!("malformed handshake: {e}")))?;

        if info.magic != PROTOCOL_MAGIC {
            // Not our protocol; get rid of the process immediately.
            let mut transport = this.transport.lock().await;
            let _ = transport.process.kill().await;
            return Err(PluginError::HandshakeRejected(format!(
                "plugin {} presented magic {:?}",
                descriptor.name, info.magic
            )));
        }

        Ok((this, info))
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn write_line(&self, json: String) -> Result<(), PluginError> {
        let mut transport = self.transport.lock().await;
        transport.stdin.write_all(json.as_bytes()).await?;
        transport.stdin.write_all(b"\n").await?;
        transport.stdin.flush().await?;
        Ok(())
    }

    /// Read lines until a response with `expected_id` appears. Anything else
    /// (plugin-side notifications, stray output that parses as JSON-RPC) is
    /// skipped.
    async fn read_response_for_id(&self, expected_id: u64) -> Result<RpcResponse, PluginError> {
        loop {
            let mut line = String::new();
            let n = {
                let mut transport = self.transport.lock().await;
                transport.stdout.read_line(&mut line).await?
            };
            if n == 0 {
                return Err(PluginError::NotRunning);
            }
            if line.len() > MAX_RESPONSE_LINE {
                return Err(PluginError::Protocol("oversized response line".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RpcResponse>(trimmed) {
                Ok(response) if response.id == expected_id => return Ok(response),
                Ok(_) => continue,
                Err(_) => {
                    tracing::debug!(plugin = %self.label, "skipping non-response plugin output");
                    continue;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PluginChannel for PluginSubprocess {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, PluginError> {
        let _rpc_guard = self.rpc_lock.lock().await;
        let id = self.next_id();
        let request = RpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)?;

        tokio::time::timeout(self.timeout, self.write_line(json))
            .await
            .map_err(|_| PluginError::Timeout)??;

        let response = tokio::time::timeout(self.timeout, self.read_response_for_id(id))
            .await
            .map_err(|_| PluginError::Timeout)??;

        if let Some(error) = response.error {
            return Err(PluginError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), PluginError> {
        let notification = RpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)?;
        tokio::time::timeout(self.timeout, self.write_line(json))
            .await
            .map_err(|_| PluginError::Timeout)?
    }

    /// Graceful shutdown: `shutdown` RPC, short wait, then kill.
    async fn shutdown(&self) -> Result<(), PluginError> {
        if let Err(error) = self.call("shutdown", None).await {
            tracing::debug!(plugin = %self.label, %error, "shutdown call failed");
        }
        let mut transport = self.transport.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), transport.process.wait()).await;
        let _ = transport.process.kill().await;
        Ok(())
    }
}

async fn drain_plugin_stderr(plugin: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut count = 0u64;
    let mut last_reset = tokio::time::Instant::now();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let msg = line.trim_end();
                if !msg.is_empty() {
                    // Rate limit: max 20 lines per second per plugin.
                    if last_reset.elapsed() > Duration::from_secs(1) {
                        count = 0;
                        last_reset = tokio::time::Instant::now();
                    }
                    count += 1;
                    if count <= 20 {
                        tracing::warn!(target: "km::plugin", plugin = %plugin, "{msg}");
                    }
                }
            }
            Err(error) => {
                tracing::debug!(plugin = %plugin, %error, "failed to read plugin stderr");
                break;
            }
        }
    }
}
