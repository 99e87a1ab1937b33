//! The interposing stream proxy.
//!
//! Three cooperating pumps: host stdin -> child stdin, child stdout -> host
//! stdout, child stderr -> host stderr. Bytes are always forwarded before
//! any observation happens, so the host MCP client never sees added latency
//! from parsing, and a parse failure can never corrupt the wire.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use km_core::Direction;
use km_protocol::{FrameError, JsonRpcEnvelope, LineFramer};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::MonitorError;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Receives classified messages after their bytes have been forwarded.
///
/// Implementations run synchronously in the pump; backpressure from a slow
/// sink intentionally slows the observation side, never the forwarding that
/// already happened for this line.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn on_message(&self, direction: Direction, envelope: JsonRpcEnvelope, raw: &[u8]);
}

/// Sink that drops everything; used when monitoring is disabled.
pub struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn on_message(&self, _direction: Direction, _envelope: JsonRpcEnvelope, _raw: &[u8]) {}
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ProxyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProxyState::Idle,
            1 => ProxyState::Running,
            2 => ProxyState::Stopping,
            _ => ProxyState::Stopped,
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub struct StreamProxy {
    state: AtomicU8,
    cancel: CancellationToken,
    max_line_len: usize,
}

impl StreamProxy {
    pub fn new(max_line_len: usize, cancel: CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(ProxyState::Idle as u8),
            cancel,
            max_line_len,
        }
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Idempotently trigger shutdown. The pumps break once their current
    /// read resolves.
    pub fn stop(&self) {
        let was_running = self
            .state
            .compare_exchange(
                ProxyState::Running as u8,
                ProxyState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if was_running {
            tracing::debug!(target: "km::monitor", "proxy stopping");
        }
        self.cancel.cancel();
    }

    /// Run the three pumps to completion.
    ///
    /// Returns when the cancellation token fires or every pump has hit end
    /// of stream. A pump that fails cancels its peers; a clean EOF lets the
    /// opposite direction keep draining.
    #[allow(clippy::too_many_arguments)]
    pub async fn run<HI, CI, CO, HO, CE, HE>(
        &self,
        host_stdin: HI,
        child_stdin: CI,
        child_stdout: CO,
        host_stdout: HO,
        child_stderr: CE,
        host_stderr: HE,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), MonitorError>
    where
        HI: AsyncRead + Unpin,
        CI: AsyncWrite + Unpin,
        CO: AsyncRead + Unpin,
        HO: AsyncWrite + Unpin,
        CE: AsyncRead + Unpin,
        HE: AsyncWrite + Unpin,
    {
        self.state
            .compare_exchange(
                ProxyState::Idle as u8,
                ProxyState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| MonitorError::ProxyAlreadyStarted)?;

        let cancel = self.cancel.clone();

        let inbound = {
            let cancel = cancel.clone();
            let sink = Arc::clone(&sink);
            let max = self.max_line_len;
            async move {
                let result = pump_lines(
                    BufReader::new(host_stdin),
                    child_stdin,
                    Direction::Inbound,
                    sink,
                    max,
                    cancel.clone(),
                )
                .await;
                // A failed pump brings the rest down; a clean EOF lets the
                // other direction finish draining.
                if result.is_err() {
                    cancel.cancel();
                }
                result
            }
        };

        let outbound = {
            let cancel = cancel.clone();
            let sink = Arc::clone(&sink);
            let max = self.max_line_len;
            async move {
                let result = pump_lines(
                    BufReader::new(child_stdout),
                    host_stdout,
                    Direction::Outbound,
                    sink,
                    max,
                    cancel.clone(),
                )
                .await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            }
        };

        let stderr = {
            let cancel = cancel.clone();
            async move { copy_stderr(child_stderr, host_stderr, cancel).await }
        };

        let (inbound, outbound, _stderr) = tokio::join!(inbound, outbound, stderr);

        self.state
            .store(ProxyState::Stopped as u8, Ordering::SeqCst);
        tracing::debug!(target: "km::monitor", "proxy stopped");

        inbound?;
        outbound?;
        Ok(())
    }
}

/// One data pump: read framed lines, forward them verbatim, then classify
/// and hand off. Forwarding always precedes the event side-effect for the
/// same line.
async fn pump_lines<R, W>(
    reader: R,
    mut writer: W,
    direction: Direction,
    sink: Arc<dyn EventSink>,
    max_line_len: usize,
    cancel: CancellationToken,
) -> Result<(), MonitorError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = LineFramer::with_max_line_len(reader, max_line_len);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = framer.next_frame() => frame.map_err(MonitorError::StreamIo)?,
        };

        let Some((frame, frame_error)) = frame else {
            break;
        };

        // Forward first, with the stripped newline restored.
        writer
            .write_all(frame.bytes())
            .await
            .map_err(MonitorError::StreamIo)?;
        writer.write_all(b"\n").await.map_err(MonitorError::StreamIo)?;
        writer.flush().await.map_err(MonitorError::StreamIo)?;

        if let Some(error) = frame_error {
            tracing::warn!(target: "km::monitor", %direction, %error, "framing error, bytes forwarded");
            continue;
        }

        match JsonRpcEnvelope::classify(frame.bytes()) {
            Ok(envelope) => {
                sink.on_message(direction, envelope, frame.bytes()).await;
            }
            Err(FrameError::InvalidJson(error)) => {
                tracing::debug!(target: "km::monitor", %direction, %error, "non-JSON line forwarded");
            }
            Err(error) => {
                tracing::debug!(target: "km::monitor", %direction, %error, "unclassifiable line forwarded");
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Byte-exact stderr copier; no parsing ever.
async fn copy_stderr<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => {
            if let Err(error) = result {
                tracing::debug!(target: "km::monitor", %error, "stderr copy ended");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        seen: Mutex<Vec<(Direction, String, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn on_message(&self, direction: Direction, envelope: JsonRpcEnvelope, raw: &[u8]) {
            self.seen
                .lock()
                .unwrap()
                .push((direction, envelope.method().to_string(), raw.to_vec()));
        }
    }

    fn proxy() -> Arc<StreamProxy> {
        Arc::new(StreamProxy::new(1024 * 1024, CancellationToken::new()))
    }

    async fn run_proxy(
        proxy: &Arc<StreamProxy>,
        host_input: &[u8],
        child_output: &[u8],
        sink: Arc<dyn EventSink>,
    ) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut child_stdin = Vec::new();
        let mut host_stdout = Vec::new();
        let mut host_stderr = Vec::new();
        proxy
            .run(
                host_input,
                &mut child_stdin,
                child_output,
                &mut host_stdout,
                b"child diagnostics\n".as_slice(),
                &mut host_stderr,
                sink,
            )
            .await
            .unwrap();
        (child_stdin, host_stdout, host_stderr)
    }

    #[tokio::test]
    async fn forwards_bytes_and_emits_events_in_order() {
        let sink = Arc::new(RecordingSink::new());
        let host_input = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n{\"jsonrpc\":\"2.0\",\"method\":\"tools/call\",\"id\":2}\n";
        let child_output = b"{\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}\n";

        let proxy = proxy();
        let (child_stdin, host_stdout, host_stderr) =
            run_proxy(&proxy, host_input, child_output, sink.clone()).await;

        assert_eq!(child_stdin, host_input);
        assert_eq!(host_stdout, child_output);
        assert_eq!(host_stderr, b"child diagnostics\n");

        let seen = sink.seen.lock().unwrap();
        let inbound: Vec<_> = seen
            .iter()
            .filter(|(d, _, _)| *d == Direction::Inbound)
            .collect();
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].1, "ping");
        assert_eq!(inbound[1].1, "tools/call");
        let outbound: Vec<_> = seen
            .iter()
            .filter(|(d, _, _)| *d == Direction::Outbound)
            .collect();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].1, "");
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn invalid_json_is_forwarded_without_events() {
        let sink = Arc::new(RecordingSink::new());
        let host_input = b"this is not json\n{\"jsonrpc\":\"2.0\",\"method\":\"a\",\"id\":1}\n";

        let proxy = proxy();
        let (child_stdin, _, _) = run_proxy(&proxy, host_input, b"", sink.clone()).await;

        assert_eq!(child_stdin, host_input);
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_line_is_forwarded_without_events() {
        let sink = Arc::new(RecordingSink::new());
        let long_line = vec![b'x'; 64];
        let mut host_input = long_line.clone();
        host_input.push(b'\n');
        host_input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"method\":\"a\",\"id\":1}\n");

        let proxy = Arc::new(StreamProxy::new(32, CancellationToken::new()));
        let (child_stdin, _, _) = run_proxy(&proxy, &host_input, b"", sink.clone()).await;

        assert_eq!(child_stdin, host_input);
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "a");
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_forwarded_without_events() {
        let sink = Arc::new(RecordingSink::new());
        let host_input = b"{\"jsonrpc\":\"1.0\",\"method\":\"old\",\"id\":1}\n";
        let proxy = proxy();
        let (child_stdin, _, _) = run_proxy(&proxy, host_input, b"", sink.clone()).await;
        assert_eq!(child_stdin, host_input);
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels_run() {
        let proxy = Arc::new(StreamProxy::new(1024, CancellationToken::new()));
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);

        // A reader that never produces data keeps the pump alive until stop.
        let (host_in, _host_in_handle) = tokio::io::duplex(64);
        let (child_out, _child_out_handle) = tokio::io::duplex(64);
        let (child_err, _child_err_handle) = tokio::io::duplex(64);

        let run = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                proxy
                    .run(
                        host_in,
                        Vec::new(),
                        child_out,
                        Vec::new(),
                        child_err,
                        Vec::new(),
                        sink,
                    )
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(proxy.state(), ProxyState::Running);
        proxy.stop();
        proxy.stop();

        tokio::time::timeout(std::time::Duration::from_secs(1), run)
            .await
            .expect("proxy must stop after cancel")
            .unwrap()
            .unwrap();
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let proxy = proxy();
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        run_proxy(&proxy, b"", b"", Arc::clone(&sink)).await;

        let err = proxy
            .run(
                b"".as_slice(),
                Vec::new(),
                b"".as_slice(),
                Vec::new(),
                b"".as_slice(),
                Vec::new(),
                sink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::ProxyAlreadyStarted));
    }
}
