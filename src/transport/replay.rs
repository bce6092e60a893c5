//! Replay of recorded mesh traffic.
//!
//! A capture is a JSON-lines file; each line is one provider event:
//!
//! ```text
//! {"type":"established"}
//! {"type":"node","id":"!a1b2c3d4","fields":{"user":{"shortName":"ABCD"}}}
//! {"type":"packet","delay_ms":250,"fields":{"from":123,"decoded":{"portnum":"TEXT_MESSAGE_APP"}}}
//! {"type":"lost"}
//! ```
//!
//! `node` lines update the replayed node table before node-updated is raised. Blank lines
//! and lines starting with `#` are ignored; malformed lines are skipped with a warning. The
//! event stream closes when the capture is exhausted.

use super::{
    Connection, TransportError, TransportEvent, TransportHandle, TransportProvider,
    TransportTarget,
};
use crate::logutil::escape_log;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureRecord {
    Established,
    Lost,
    Node {
        id: String,
        #[serde(default)]
        fields: Value,
    },
    Packet {
        #[serde(default)]
        fields: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureLine {
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(flatten)]
    pub record: CaptureRecord,
}

/// Parse a capture, skipping blank, comment and malformed lines.
pub fn parse_capture(text: &str) -> Vec<CaptureLine> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            match serde_json::from_str::<CaptureLine>(line) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(
                        "capture line {} skipped ({}): {}",
                        idx + 1,
                        e,
                        escape_log(line)
                    );
                    None
                }
            }
        })
        .collect()
}

type NodeTable = Arc<Mutex<BTreeMap<String, Value>>>;

/// Provider that replays a capture file regardless of the requested link kind.
pub struct ReplayProvider {
    path: PathBuf,
    /// Multiplier applied to recorded delays (0 replays as fast as possible).
    pace: f64,
}

impl ReplayProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pace: 1.0,
        }
    }

    pub fn with_pace(mut self, pace: f64) -> Self {
        self.pace = if pace.is_finite() && pace >= 0.0 { pace } else { 1.0 };
        self
    }
}

#[async_trait]
impl TransportProvider for ReplayProvider {
    async fn open(&self, target: &TransportTarget) -> Result<Connection, TransportError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| TransportError::Open {
                target: target.to_string(),
                reason: format!("cannot read capture {}: {}", self.path.display(), e),
            })?;
        let lines = parse_capture(&text);
        info!(
            "Replaying {} capture events from {} as {}",
            lines.len(),
            self.path.display(),
            target
        );

        let nodes: NodeTable = Arc::new(Mutex::new(BTreeMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let feeder = tokio::spawn(feed(lines, nodes.clone(), tx, self.pace));

        Ok(Connection {
            handle: Box::new(ReplayHandle {
                nodes,
                feeder: Some(feeder),
            }),
            events: rx,
        })
    }
}

async fn feed(
    lines: Vec<CaptureLine>,
    nodes: NodeTable,
    tx: mpsc::UnboundedSender<TransportEvent>,
    pace: f64,
) {
    for line in lines {
        let delay = (line.delay_ms as f64 * pace) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let event = match line.record {
            CaptureRecord::Established => TransportEvent::ConnectionEstablished,
            CaptureRecord::Lost => TransportEvent::ConnectionLost,
            CaptureRecord::Node { id, fields } => {
                nodes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, fields);
                TransportEvent::NodeUpdated
            }
            CaptureRecord::Packet { fields } => TransportEvent::PacketReceived(fields),
        };
        if tx.send(event).is_err() {
            debug!("replay receiver gone; stopping feeder");
            return;
        }
    }
    debug!("replay capture exhausted");
}

struct ReplayHandle {
    nodes: NodeTable,
    feeder: Option<JoinHandle<()>>,
}

impl TransportHandle for ReplayHandle {
    fn node_table(&self) -> Result<Vec<(String, Value)>, TransportError> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(nodes
            .iter()
            .map(|(id, fields)| (id.clone(), fields.clone()))
            .collect())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self.feeder.take() {
            Some(feeder) => {
                feeder.abort();
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all_record_kinds() {
        let text = r#"
# recorded on the bench
{"type":"established"}
{"type":"node","id":"!a1b2c3d4","fields":{"user":{"shortName":"ABCD"}}}
{"type":"packet","delay_ms":250,"fields":{"from":123}}
not json
{"type":"lost"}
"#;
        let lines = parse_capture(text);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].record, CaptureRecord::Established);
        assert_eq!(
            lines[1].record,
            CaptureRecord::Node {
                id: "!a1b2c3d4".into(),
                fields: json!({"user": {"shortName": "ABCD"}})
            }
        );
        assert_eq!(lines[2].delay_ms, 250);
        assert_eq!(lines[3].record, CaptureRecord::Lost);
    }

    #[test]
    fn unknown_type_is_skipped() {
        assert!(parse_capture(r#"{"type":"teleport"}"#).is_empty());
    }

    #[tokio::test]
    async fn replays_events_and_node_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"node\",\"id\":\"!1\",\"fields\":{}}\n{\"type\":\"packet\",\"fields\":{\"id\":7}}\n",
        )
        .unwrap();

        let provider = ReplayProvider::new(&path).with_pace(0.0);
        let target = TransportTarget::Serial { port: "/dev/null".into() };
        let Connection { mut handle, mut events } = provider.open(&target).await.unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::NodeUpdated));
        assert_eq!(handle.node_table().unwrap().len(), 1);
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::PacketReceived(json!({"id": 7})))
        );
        assert_eq!(events.recv().await, None);
        assert!(handle.close().is_ok());
        assert!(matches!(handle.close(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn missing_capture_fails_open() {
        let provider = ReplayProvider::new("/nonexistent/capture.jsonl");
        let target = TransportTarget::Network { host: "10.0.0.5".into() };
        let err = provider.open(&target).await.err().unwrap();
        assert!(err.to_string().starts_with("failed to open network on 10.0.0.5"));
    }
}
