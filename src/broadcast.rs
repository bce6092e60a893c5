//! # Event Broadcaster
//!
//! Typed fan-out from the connection worker to any number of consumers. There are four
//! independent channels, one per event category:
//!
//! - [`EventBroadcaster::node_discovered`] carries [`Node`]
//! - [`EventBroadcaster::packet_received`] carries [`Packet`]
//! - [`EventBroadcaster::connection_status`] carries [`ConnectionStatus`]
//! - [`EventBroadcaster::log_message`] carries [`LogMessage`]
//!
//! Each subscriber owns an unbounded queue, so publishing never waits on a slow consumer and
//! events are never dropped; delivery to one subscriber is FIFO within a channel. Subscribers
//! whose receiver has been dropped are pruned on the next publish. The subscriber list is the
//! only state shared between the publishing worker and consumer threads and is guarded by a
//! mutex that is never held across an await.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshscope::broadcast::EventBroadcaster;
//!
//! #[tokio::main]
//! async fn main() {
//!     let events = EventBroadcaster::new();
//!     let mut nodes = events.node_discovered().subscribe();
//!     while let Some(node) = nodes.recv().await {
//!         println!("{} ({})", node.long_name, node.id);
//!     }
//! }
//! ```

use crate::model::{ConnectionStatus, LogLevel, LogMessage, Node, Packet};
use log::{error, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Identifies one subscription on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// One broadcast channel of a single event type.
pub struct Channel<T> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, mpsc::UnboundedSender<T>)>>,
}

/// Receiving end of a channel subscription. Dropping it unsubscribes lazily.
pub struct Subscription<T> {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive for consumers that poll (e.g. a UI timer).
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

impl<T: Clone + Send + 'static> Channel<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriberId, mpsc::UnboundedSender<T>)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push((id, tx));
        trace!("{}: subscriber {:?} added", self.name, id);
        Subscription { id, rx }
    }

    /// Register a callback consumer. The callback runs on its own task; a panic inside it is
    /// logged and the consumer keeps receiving subsequent events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_with<F>(&self, mut handler: F) -> SubscriberId
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut sub = self.subscribe();
        let id = sub.id();
        let name = self.name;
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    crate::metrics::inc_handler_panics();
                    error!("{}: subscriber {:?} panicked while handling an event", name, id);
                }
            }
            trace!("{}: callback subscriber {:?} finished", name, id);
        });
        id
    }

    /// Remove a subscriber; its queue closes after already-delivered events are read.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    /// Deliver `event` to every live subscriber. Returns the number of deliveries.
    pub fn publish(&self, event: T) -> usize {
        let mut subs = self.lock();
        let mut delivered = 0;
        subs.retain(|(id, tx)| match tx.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                trace!("{}: pruning closed subscriber {:?}", self.name, id);
                false
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

struct Channels {
    nodes: Channel<Node>,
    packets: Channel<Packet>,
    status: Channel<ConnectionStatus>,
    logs: Channel<LogMessage>,
}

/// Cheaply cloneable handle to the four event channels.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Channels>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Channels {
                nodes: Channel::new("nodeDiscovered"),
                packets: Channel::new("packetReceived"),
                status: Channel::new("connectionStatusChanged"),
                logs: Channel::new("logMessage"),
            }),
        }
    }

    pub fn node_discovered(&self) -> &Channel<Node> {
        &self.inner.nodes
    }

    pub fn packet_received(&self) -> &Channel<Packet> {
        &self.inner.packets
    }

    pub fn connection_status(&self) -> &Channel<ConnectionStatus> {
        &self.inner.status
    }

    pub fn log_message(&self) -> &Channel<LogMessage> {
        &self.inner.logs
    }

    /// Publish a log event and mirror it to the `log` facade.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let msg = LogMessage::new(level, message);
        log::log!(log::Level::from(level), "{}", msg.message);
        self.inner.logs.publish(msg);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber_in_order() {
        let events = EventBroadcaster::new();
        let mut a = events.log_message().subscribe();
        let mut b = events.log_message().subscribe();
        events.log(LogLevel::Info, "one");
        events.log(LogLevel::Error, "two");
        for sub in [&mut a, &mut b] {
            let got: Vec<String> = sub.drain().into_iter().map(|m| m.message).collect();
            assert_eq!(got, vec!["one", "two"]);
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let events = EventBroadcaster::new();
        let keep = events.connection_status().subscribe();
        let gone = events.connection_status().subscribe();
        drop(gone);
        assert_eq!(events.connection_status().publish(ConnectionStatus::up("Connected")), 1);
        assert_eq!(events.connection_status().subscriber_count(), 1);
        drop(keep);
        assert_eq!(events.connection_status().publish(ConnectionStatus::down("x")), 0);
    }

    #[test]
    fn unsubscribe_closes_queue_after_backlog() {
        let events = EventBroadcaster::new();
        let mut sub = events.log_message().subscribe();
        events.log(LogLevel::Debug, "before");
        assert!(events.log_message().unsubscribe(sub.id()));
        assert!(!events.log_message().unsubscribe(sub.id()));
        events.log(LogLevel::Debug, "after");
        assert_eq!(sub.try_recv().map(|m| m.message), Some("before".to_string()));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn channels_are_independent() {
        let events = EventBroadcaster::new();
        let mut status = events.connection_status().subscribe();
        events.log(LogLevel::Info, "noise");
        assert!(status.try_recv().is_none());
        assert_eq!(events.log_message().name(), "logMessage");
    }
}
