//! Background worker servicing one connection attempt.
//!
//! The worker opens the transport, announces the connection, enumerates the node table once,
//! then dispatches provider events to named handlers until shutdown is requested or the
//! provider's stream ends. Each handler invocation is isolated: an error is logged, a panic is
//! caught, and the loop continues.

use super::Shared;
use crate::broadcast::EventBroadcaster;
use crate::logutil::escape_log;
use crate::metrics;
use crate::model::{ConnectionState, ConnectionStatus, LogLevel};
use crate::normalize::{parse_node, parse_packet};
use crate::transport::{
    Connection, TransportEvent, TransportHandle, TransportProvider, TransportTarget,
};
use log::{debug, info};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub(super) struct Worker {
    provider: Arc<dyn TransportProvider>,
    shared: Arc<Shared>,
    target: TransportTarget,
    shutdown: watch::Receiver<bool>,
}

enum Exit {
    Shutdown,
    StreamClosed,
}

impl Worker {
    pub(super) fn new(
        provider: Arc<dyn TransportProvider>,
        shared: Arc<Shared>,
        target: TransportTarget,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            shared,
            target,
            shutdown,
        }
    }

    pub(super) async fn run(mut self) {
        let Some(Connection { handle, events }) = self.establish().await else {
            return;
        };

        if !self.shared.transition(
            ConnectionState::Connected,
            Some(ConnectionStatus::up("Connected")),
        ) {
            // Disconnect won the race while the link was opening.
            Session::new(handle, self.shared.events.clone()).close();
            return;
        }

        let mut session = Session::new(handle, self.shared.events.clone());
        session.events.log(
            LogLevel::Info,
            format!("Interface started via {}", self.target.kind()),
        );
        session.guarded("initial node discovery", Session::discover_nodes);

        let exit = self.pump(&mut session, events).await;
        session.close();

        let reason = match exit {
            Exit::Shutdown => "Disconnected",
            Exit::StreamClosed => "Transport closed",
        };
        self.shared.transition(
            ConnectionState::Disconnected,
            Some(ConnectionStatus::down(reason)),
        );
        debug!("connection worker for {} exited ({})", self.target, reason);
    }

    /// Open the transport, racing it against shutdown. The open runs on its own task so a
    /// panicking provider is reported like any other connection error.
    async fn establish(&mut self) -> Option<Connection> {
        let provider = self.provider.clone();
        let target = self.target.clone();
        let mut open = tokio::spawn(async move { provider.open(&target).await });

        let outcome = tokio::select! {
            res = &mut open => res,
            _ = shutdown_requested(&mut self.shutdown) => {
                open.abort();
                // The open may have finished before the abort landed.
                if let Ok(Ok(Connection { handle, .. })) = open.await {
                    Session::new(handle, self.shared.events.clone()).close();
                }
                info!("connect to {} cancelled", self.target);
                self.shared.transition(
                    ConnectionState::Disconnected,
                    Some(ConnectionStatus::down("Disconnected")),
                );
                return None;
            }
        };

        let reason = match outcome {
            Ok(Ok(connection)) => return Some(connection),
            Ok(Err(e)) => e.to_string(),
            Err(join_err) if join_err.is_panic() => {
                format!("transport panicked while connecting to {}", self.target)
            }
            Err(_) => format!("connect to {} was cancelled", self.target),
        };
        metrics::inc_connect_failures();
        self.shared
            .events
            .log(LogLevel::Error, format!("Connection error: {}", reason));
        self.shared.transition(
            ConnectionState::Failed(reason.clone()),
            Some(ConnectionStatus::down(reason)),
        );
        None
    }

    async fn pump(
        &mut self,
        session: &mut Session,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Exit::Shutdown,
                event = events.recv() => match event {
                    Some(event) => session.dispatch(event),
                    None => return Exit::StreamClosed,
                },
            }
        }
    }
}

/// Resolves once shutdown is signalled or the manager side is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// An established connection and the handlers bound to it.
struct Session {
    handle: Box<dyn TransportHandle>,
    events: EventBroadcaster,
}

impl Session {
    fn new(handle: Box<dyn TransportHandle>, events: EventBroadcaster) -> Self {
        Self { handle, events }
    }

    fn dispatch(&mut self, event: TransportEvent) {
        self.guarded(event_name(&event), |session| match &event {
            TransportEvent::ConnectionEstablished => session.on_connection_established(),
            TransportEvent::ConnectionLost => session.on_connection_lost(),
            TransportEvent::NodeUpdated => session.on_node_updated(),
            TransportEvent::PacketReceived(fields) => session.on_packet_received(fields),
        });
    }

    /// Run `handler`, turning a panic into an ERROR log event.
    fn guarded(&mut self, what: &str, handler: impl FnOnce(&mut Self)) {
        if catch_unwind(AssertUnwindSafe(|| handler(self))).is_err() {
            metrics::inc_handler_panics();
            self.events.log(
                LogLevel::Error,
                format!("Handler for {} panicked; event dropped", what),
            );
        }
    }

    fn on_connection_established(&mut self) {
        self.events
            .connection_status()
            .publish(ConnectionStatus::up("Connection established"));
        self.events.log(LogLevel::Info, "Connection established");
    }

    fn on_connection_lost(&mut self) {
        self.events
            .connection_status()
            .publish(ConnectionStatus::down("Connection lost"));
        self.events.log(LogLevel::Info, "Connection lost");
    }

    fn on_node_updated(&mut self) {
        debug!("node table updated; re-enumerating");
        self.discover_nodes();
    }

    fn on_packet_received(&mut self, fields: &Value) {
        let parsed = parse_packet(fields);
        for issue in &parsed.issues {
            metrics::inc_normalize_issues();
            self.events.log(
                LogLevel::Error,
                format!("Error processing packet {}: {}", parsed.value.id, issue),
            );
        }
        let packet = parsed.value;
        let summary = format!(
            "Packet received: {} -> {} ({})",
            packet.from_node,
            packet.to_node,
            escape_log(&packet.port_number)
        );
        metrics::inc_packets_received();
        self.events.packet_received().publish(packet);
        self.events.log(LogLevel::Debug, summary);
    }

    /// Normalize every entry of the provider's node table and publish one event per node.
    fn discover_nodes(&mut self) {
        let entries = match self.handle.node_table() {
            Ok(entries) => entries,
            Err(e) => {
                self.events
                    .log(LogLevel::Error, format!("Error discovering nodes: {}", e));
                return;
            }
        };
        for (raw_id, fields) in entries {
            match parse_node(&raw_id, &fields) {
                Ok(parsed) => {
                    for issue in &parsed.issues {
                        metrics::inc_normalize_issues();
                        self.events.log(
                            LogLevel::Error,
                            format!(
                                "Error parsing node info for {}: {}",
                                escape_log(&parsed.value.id),
                                issue
                            ),
                        );
                    }
                    metrics::inc_nodes_discovered();
                    self.events.node_discovered().publish(parsed.value);
                }
                Err(issue) => {
                    metrics::inc_normalize_issues();
                    self.events.log(
                        LogLevel::Error,
                        format!("Skipping node entry '{}': {}", escape_log(&raw_id), issue),
                    );
                }
            }
        }
    }

    /// Best-effort close; failures are logged and swallowed.
    fn close(&mut self) {
        match self.handle.close() {
            Ok(()) => self.events.log(LogLevel::Info, "Connection closed"),
            Err(e) => self
                .events
                .log(LogLevel::Warn, format!("Error closing transport: {}", e)),
        }
    }
}

fn event_name(event: &TransportEvent) -> &'static str {
    match event {
        TransportEvent::ConnectionEstablished => "connection-established",
        TransportEvent::ConnectionLost => "connection-lost",
        TransportEvent::NodeUpdated => "node-updated",
        TransportEvent::PacketReceived(_) => "packet-received",
    }
}
