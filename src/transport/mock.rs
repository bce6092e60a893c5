//! Scriptable in-process transport provider.
//!
//! A [`MockProvider`] is both the provider handed to the connection manager and the remote
//! control used to drive it: push events, edit the node table, and inject failures.
//! Clones share state.

use super::{
    Connection, TransportError, TransportEvent, TransportHandle, TransportProvider,
    TransportTarget,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    nodes: BTreeMap<String, Value>,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    opened: Vec<TransportTarget>,
    closes: usize,
    open_error: Option<String>,
    open_delay: Option<Duration>,
    close_error: Option<String>,
    node_table_error: Option<String>,
    panic_on_node_table: bool,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `open` fail with `reason`.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.lock().open_error = Some(reason.into());
    }

    /// Delay every `open` (simulates a slow link).
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = Some(delay);
    }

    pub fn fail_close(&self, reason: impl Into<String>) {
        self.lock().close_error = Some(reason.into());
    }

    pub fn fail_node_table(&self, reason: Option<String>) {
        self.lock().node_table_error = reason;
    }

    pub fn panic_on_node_table(&self, enabled: bool) {
        self.lock().panic_on_node_table = enabled;
    }

    pub fn upsert_node(&self, id: impl Into<String>, fields: Value) {
        self.lock().nodes.insert(id.into(), fields);
    }

    /// Push an event to the open connection. Returns false if nothing is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &self.lock().events_tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Upsert a node-table entry and raise node-updated.
    pub fn node_updated(&self, id: impl Into<String>, fields: Value) -> bool {
        self.upsert_node(id, fields);
        self.emit(TransportEvent::NodeUpdated)
    }

    pub fn packet(&self, fields: Value) -> bool {
        self.emit(TransportEvent::PacketReceived(fields))
    }

    /// End the event stream as if the link vanished.
    pub fn drop_stream(&self) {
        self.lock().events_tx = None;
    }

    pub fn opened_targets(&self) -> Vec<TransportTarget> {
        self.lock().opened.clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn is_open(&self) -> bool {
        self.lock().events_tx.is_some()
    }
}

#[async_trait]
impl TransportProvider for MockProvider {
    async fn open(&self, target: &TransportTarget) -> Result<Connection, TransportError> {
        let delay = self.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.opened.push(target.clone());
        if let Some(reason) = state.open_error.take() {
            return Err(TransportError::Open {
                target: target.to_string(),
                reason,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events_tx = Some(tx);
        Ok(Connection {
            handle: Box::new(MockHandle {
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl TransportHandle for MockHandle {
    fn node_table(&self) -> Result<Vec<(String, Value)>, TransportError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.panic_on_node_table {
            drop(state);
            panic!("mock node table exploded");
        }
        if let Some(reason) = &state.node_table_error {
            return Err(TransportError::Other(reason.clone()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|(id, fields)| (id.clone(), fields.clone()))
            .collect())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events_tx = None;
        state.closes += 1;
        match state.close_error.take() {
            Some(reason) => Err(TransportError::Other(reason)),
            None => Ok(()),
        }
    }
}
