//! # Transport Provider Boundary
//!
//! The ingestion core does not speak any radio link itself. A [`TransportProvider`] opens a
//! link for a validated [`TransportTarget`] and hands back a [`Connection`]: a
//! [`TransportHandle`] (node table + close) and a push stream of [`TransportEvent`]s.
//!
//! Events may be produced on any thread the provider owns; the stream is a Tokio unbounded
//! channel so the provider never waits on the connection worker.
//!
//! Providers shipped with the crate:
//!
//! - [`replay::ReplayProvider`] replays a recorded JSON-lines capture
//! - [`mock::MockProvider`] is scripted in-process (tests, embedding)
//!
//! ## Supported kinds
//!
//! | kind      | aliases                               | required parameter |
//! |-----------|---------------------------------------|--------------------|
//! | `serial`  |                                       | `port`             |
//! | `network` | `tcp`                                 | `host`             |
//! | `ble`     | `bluetooth`, `short-range-wireless`   | `address`          |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

pub mod mock;
pub mod replay;

/// Physical link family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Network,
    Ble,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Network => "network",
            TransportKind::Ble => "ble",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(TransportKind::Serial),
            "network" | "tcp" => Ok(TransportKind::Network),
            "ble" | "bluetooth" | "short-range-wireless" | "shortrange-wireless" => {
                Ok(TransportKind::Ble)
            }
            _ => Err(ConnectError::UnsupportedKind(s.to_string())),
        }
    }
}

/// Caller-supplied connection parameters; which one is required depends on the kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ConnectParams {
    pub fn serial(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Default::default()
        }
    }

    pub fn network(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn ble(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

/// Validated link target handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportTarget {
    Serial { port: String },
    Network { host: String },
    Ble { address: String },
}

impl TransportTarget {
    /// Validate `params` for `kind`. Blank values count as missing.
    pub fn resolve(kind: TransportKind, params: &ConnectParams) -> Result<Self, ConnectError> {
        fn required(
            value: &Option<String>,
            kind: TransportKind,
            parameter: &'static str,
        ) -> Result<String, ConnectError> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(ConnectError::MissingParameter { kind, parameter })
        }

        Ok(match kind {
            TransportKind::Serial => TransportTarget::Serial {
                port: required(&params.port, kind, "port")?,
            },
            TransportKind::Network => TransportTarget::Network {
                host: required(&params.host, kind, "host")?,
            },
            TransportKind::Ble => TransportTarget::Ble {
                address: required(&params.address, kind, "address")?,
            },
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportTarget::Serial { .. } => TransportKind::Serial,
            TransportTarget::Network { .. } => TransportKind::Network,
            TransportTarget::Ble { .. } => TransportKind::Ble,
        }
    }

    /// Port path, host or device address.
    pub fn endpoint(&self) -> &str {
        match self {
            TransportTarget::Serial { port } => port,
            TransportTarget::Network { host } => host,
            TransportTarget::Ble { address } => address,
        }
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.kind(), self.endpoint())
    }
}

/// Rejected connect request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("unsupported transport kind '{0}' (expected serial, network or ble)")]
    UnsupportedKind(String),
    #[error("{kind} transport requires a {parameter}")]
    MissingParameter {
        kind: TransportKind,
        parameter: &'static str,
    },
    #[error("no Tokio runtime available to run the connection worker")]
    NoRuntime,
}

/// Failure reported by a transport provider.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open {target}: {reason}")]
    Open { target: String, reason: String },
    #[error("transport is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Push notifications raised by a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionEstablished,
    ConnectionLost,
    /// Something in the node table changed; the table itself is re-read via the handle.
    NodeUpdated,
    /// Raw packet field bag.
    PacketReceived(Value),
}

/// An open link.
pub struct Connection {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Control surface of an open link.
pub trait TransportHandle: Send {
    /// Current node table as `(node id, raw fields)` pairs.
    fn node_table(&self) -> Result<Vec<(String, Value)>, TransportError>;

    /// Release the link. Called exactly once by the connection worker.
    fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn open(&self, target: &TransportTarget) -> Result<Connection, TransportError>;
}
