//! # meshscope - Telemetry Ingestion for Packet-Radio Mesh Networks
//!
//! meshscope is the ingestion core of a mesh network monitor. A long-lived background worker
//! opens a transport connection to a mesh radio, receives loosely-typed event payloads,
//! normalizes them into stable typed entities and republishes them to any number of
//! independent observers (list views, tables, map renderers) without blocking the producer.
//!
//! ## Features
//!
//! - **Connection Manager**: single-connection lifecycle with an explicit state machine and a
//!   bounded, non-blocking shutdown.
//! - **Defensive Normalization**: missing or malformed fields never abort an event; they fall
//!   back to documented defaults and are reported as log events.
//! - **Typed Fan-out**: four independent event channels with per-subscriber FIFO queues.
//! - **Stable Colors**: every node id maps to the same display color on every run.
//! - **Replay**: recorded JSON-lines captures can be fed through the full pipeline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshscope::broadcast::EventBroadcaster;
//! use meshscope::connection::ConnectionManager;
//! use meshscope::transport::{replay::ReplayProvider, ConnectParams};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let events = EventBroadcaster::new();
//!     let mut nodes = events.node_discovered().subscribe();
//!
//!     let provider = Arc::new(ReplayProvider::new("capture.jsonl"));
//!     let mut manager = ConnectionManager::new(provider, events.clone());
//!     manager.connect("network", &ConnectParams::network("10.0.0.5"))?;
//!
//!     if let Some(node) = nodes.recv().await {
//!         println!("discovered {} ({})", node.long_name, node.id);
//!     }
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`model`] - Entity model: nodes, packets, connection state and log events
//! - [`color`] - Deterministic node id to display color mapping
//! - [`normalize`] - Raw field bags to typed entities
//! - [`broadcast`] - Typed multi-subscriber event channels
//! - [`transport`] - Transport provider boundary plus replay and mock providers
//! - [`connection`] - Connection manager and its background worker
//! - [`monitor`] - Headless consumer keeping an in-memory view of the mesh
//! - [`config`] - TOML configuration for the binary
//! - [`metrics`] - Process-wide ingestion counters
//! - [`logutil`] - Sanitizing radio-supplied strings for single-line logs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Transport     │ ← Provider: open, node table, push events
//! │   Provider      │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Connection    │ ← Worker: normalize, isolate handler failures
//! │   Manager       │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Event         │ ← Fan-out to every subscriber
//! │   Broadcaster   │
//! └─────────────────┘
//! ```

pub mod broadcast;
pub mod color;
pub mod config;
pub mod connection;
pub mod logutil;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod normalize;
pub mod transport;
