//! Headless event consumer.
//!
//! [`MeshView`] is what a list, table or map renderer keeps: nodes upserted by id, a bounded
//! packet history, a bounded log buffer and the last connection status. The CLI uses it to
//! print a summary after a replay.

use crate::broadcast::{EventBroadcaster, SubscriberId};
use crate::color::color_for;
use crate::config::MonitorConfig;
use crate::model::{ConnectionStatus, LogLevel, LogMessage, Node, Packet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct MeshView {
    nodes: BTreeMap<String, Node>,
    packets: VecDeque<Packet>,
    logs: VecDeque<LogMessage>,
    status: Option<ConnectionStatus>,
    max_packets: usize,
    max_log_lines: usize,
}

impl MeshView {
    pub fn new(max_packets: usize, max_log_lines: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            packets: VecDeque::new(),
            logs: VecDeque::new(),
            status: None,
            max_packets,
            max_log_lines,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.max_packets, config.max_log_lines)
    }

    /// Insert or replace the node with the same id.
    pub fn apply_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn apply_packet(&mut self, packet: Packet) {
        push_capped(&mut self.packets, packet, self.max_packets);
    }

    pub fn apply_status(&mut self, status: ConnectionStatus) {
        self.status = Some(status);
    }

    pub fn apply_log(&mut self, message: LogMessage) {
        push_capped(&mut self.logs, message, self.max_log_lines);
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Oldest first.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogMessage> {
        self.logs.iter()
    }

    pub fn status(&self) -> Option<&ConnectionStatus> {
        self.status.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.status.as_ref().map(|s| s.connected).unwrap_or(false)
    }

    pub fn summary(&self) -> ViewSummary {
        let mut ports = BTreeMap::new();
        for packet in &self.packets {
            *ports.entry(packet.port_number.clone()).or_insert(0) += 1;
        }
        let errors = self
            .logs
            .iter()
            .filter(|m| m.level == LogLevel::Error)
            .count();
        ViewSummary {
            connected: self.is_connected(),
            last_status: self.status.as_ref().map(|s| s.reason.clone()),
            node_count: self.nodes.len(),
            packet_count: self.packets.len(),
            log_lines: self.logs.len(),
            error_lines: errors,
            ports,
            nodes: self
                .nodes
                .values()
                .map(|n| NodeSummary {
                    id: n.id.clone(),
                    short_name: n.short_name.clone(),
                    long_name: n.long_name.clone(),
                    color: color_for(&n.id).hex(),
                    last_heard: n.last_heard,
                    has_position: n.position.is_some(),
                })
                .collect(),
        }
    }
}

impl Default for MeshView {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub short_name: String,
    pub long_name: String,
    pub color: String,
    pub last_heard: DateTime<Utc>,
    pub has_position: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewSummary {
    pub connected: bool,
    pub last_status: Option<String>,
    pub node_count: usize,
    pub packet_count: usize,
    pub log_lines: usize,
    pub error_lines: usize,
    /// Packet count per application port.
    pub ports: BTreeMap<String, usize>,
    pub nodes: Vec<NodeSummary>,
}

/// A [`MeshView`] fed by callback subscriptions on all four channels.
#[derive(Clone)]
pub struct SharedView {
    view: Arc<Mutex<MeshView>>,
    events: EventBroadcaster,
    subscriptions: [SubscriberId; 4],
}

impl SharedView {
    /// Subscribe `view` to `events`. Must be called inside a Tokio runtime.
    pub fn attach(events: &EventBroadcaster, view: MeshView) -> Self {
        let view = Arc::new(Mutex::new(view));
        let v = view.clone();
        let nodes = events
            .node_discovered()
            .subscribe_with(move |node| relock(&v).apply_node(node));
        let v = view.clone();
        let packets = events
            .packet_received()
            .subscribe_with(move |packet| relock(&v).apply_packet(packet));
        let v = view.clone();
        let status = events
            .connection_status()
            .subscribe_with(move |status| relock(&v).apply_status(status));
        let v = view.clone();
        let logs = events
            .log_message()
            .subscribe_with(move |message| relock(&v).apply_log(message));

        Self {
            view,
            events: events.clone(),
            subscriptions: [nodes, packets, status, logs],
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MeshView> {
        relock(&self.view)
    }

    pub fn summary(&self) -> ViewSummary {
        self.lock().summary()
    }

    /// Stop receiving events. The view keeps what it has.
    pub fn detach(&self) {
        let [nodes, packets, status, logs] = self.subscriptions;
        self.events.node_discovered().unsubscribe(nodes);
        self.events.packet_received().unsubscribe(packets);
        self.events.connection_status().unsubscribe(status);
        self.events.log_message().unsubscribe(logs);
    }
}

fn relock(view: &Mutex<MeshView>) -> MutexGuard<'_, MeshView> {
    view.lock().unwrap_or_else(|e| e.into_inner())
}
