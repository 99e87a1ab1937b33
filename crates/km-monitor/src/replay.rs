//! Replay source: feeds a recorded capture file through the event pipeline
//! instead of spawning a child process.
//!
//! Format: JSON lines, each `{"direction": "inbound"|"outbound", "line": "<raw JSON-RPC text>"}`.

use std::path::Path;
use std::sync::Arc;

use km_core::Direction;
use km_protocol::JsonRpcEnvelope;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;

use crate::proxy::EventSink;
use crate::MonitorError;

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    direction: Direction,
    line: String,
}

/// Feed every record through the sink. Returns the number of messages
/// replayed; unparsable records are skipped with a warning.
pub async fn replay_file(path: &Path, sink: Arc<dyn EventSink>) -> Result<u64, MonitorError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| MonitorError::Replay(format!("{}: {e}", path.display())))?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut replayed = 0u64;
    let mut line_no = 0u64;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| MonitorError::Replay(e.to_string()))?
    {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: ReplayRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(target: "km::monitor", line = line_no, %error, "skipping replay record");
                continue;
            }
        };

        match JsonRpcEnvelope::classify(record.line.as_bytes()) {
            Ok(envelope) => {
                sink.on_message(record.direction, envelope, record.line.as_bytes())
                    .await;
                replayed += 1;
            }
            Err(error) => {
                tracing::warn!(target: "km::monitor", line = line_no, %error, "skipping non-JSON-RPC replay line");
            }
        }
    }

    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CountingSink {
        seen: Mutex<Vec<(Direction, String)>>,
    }

    #[async_trait::async_trait]
    impl EventSink for CountingSink {
        async fn on_message(&self, direction: Direction, envelope: JsonRpcEnvelope, _raw: &[u8]) {
            self.seen
                .lock()
                .unwrap()
                .push((direction, envelope.method().to_string()));
        }
    }

    #[tokio::test]
    async fn replays_records_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"direction":"inbound","line":"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}"}"#,
                "\n",
                "not a record\n",
                "\n",
                r#"{"direction":"outbound","line":"{\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}"}"#,
                "\n",
                r#"{"direction":"inbound","line":"not json rpc"}"#,
                "\n",
            ),
        )
        .unwrap();

        let sink = Arc::new(CountingSink {
            seen: Mutex::new(Vec::new()),
        });
        let replayed = replay_file(&path, sink.clone()).await.unwrap();
        assert_eq!(replayed, 2);

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen[0], (Direction::Inbound, "ping".to_string()));
        assert_eq!(seen[1], (Direction::Outbound, String::new()));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let sink = Arc::new(CountingSink {
            seen: Mutex::new(Vec::new()),
        });
        assert!(replay_file(Path::new("/no/such/capture.jsonl"), sink)
            .await
            .is_err());
    }
}
