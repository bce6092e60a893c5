//! # Entity Model
//!
//! Typed, value-compared representations of what the ingestion core observes on the mesh:
//! discovered [`Node`]s, received [`Packet`]s, and the connection/log events that accompany
//! them. Values are produced by [`crate::normalize`] and fanned out by
//! [`crate::broadcast::EventBroadcaster`]; consumers upsert nodes by [`Node::id`] and treat
//! packets as append-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Geographic fix reported by a node. Only built when both latitude and longitude are known
/// and non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level; 0 when the node did not report one.
    pub altitude: f64,
    /// When the fix was taken, if the node reported it.
    pub time: Option<DateTime<Utc>>,
    pub location_source: Option<String>,
}

/// A discovered mesh participant and its last known telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Transport-assigned identifier (e.g. `!a1b2c3d4`). Never empty.
    pub id: String,
    pub num: Option<u32>,
    pub short_name: String,
    pub long_name: String,
    pub hardware_model: String,
    pub role: Option<String>,
    pub mac_address: Option<String>,
    pub public_key: Option<String>,
    pub is_unmessagable: Option<bool>,
    pub position: Option<Position>,
    pub last_heard: DateTime<Utc>,
    pub snr: Option<f64>,
    pub hops_away: Option<u32>,
    /// Percentage as reported; not range-checked.
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<u64>,
}

/// Numeric node reference as carried in packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    Num(u32),
    Unknown,
}

impl NodeRef {
    /// Destination used by the mesh for "everyone".
    pub const BROADCAST: u32 = 0xFFFF_FFFF;

    pub fn num(&self) -> Option<u32> {
        match self {
            NodeRef::Num(n) => Some(*n),
            NodeRef::Unknown => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, NodeRef::Num(Self::BROADCAST))
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Num(n) if *n == Self::BROADCAST => write!(f, "^all"),
            NodeRef::Num(n) => write!(f, "{}", n),
            NodeRef::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One received radio frame, normalized. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: u32,
    pub from_node: NodeRef,
    pub to_node: NodeRef,
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub port_number: String,
    /// Opaque payload exactly as the transport delivered it (`Null` when absent).
    pub payload: serde_json::Value,
    pub payload_size: usize,
    pub text: Option<String>,
    pub rx_time: DateTime<Utc>,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub relay_node: Option<u32>,
    pub next_hop: Option<u32>,
    pub channel: Option<u32>,
    pub want_ack: Option<bool>,
    pub pki_encrypted: Option<bool>,
    pub public_key: Option<String>,
    pub bitfield: Option<u32>,
}

/// Lifecycle of the single transport connection owned by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

impl ConnectionState {
    /// Legal edges:
    /// `Idle|Disconnected|Failed -> Connecting`, `Connecting -> Connected|Failed|Disconnected`,
    /// `Connected -> Disconnected`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Disconnected, Connecting)
                | (Failed(_), Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed(_))
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }

    /// True while a worker owns (or is acquiring) a transport.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Payload of the `connectionStatusChanged` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub reason: String,
}

impl ConnectionStatus {
    pub fn up(reason: impl Into<String>) -> Self {
        Self {
            connected: true,
            reason: reason.into(),
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            connected: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the `logMessage` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogMessage {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}
