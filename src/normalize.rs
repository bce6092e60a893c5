//! # Payload Normalizer
//!
//! Converts the loosely structured field bags delivered by a transport provider (JSON-like
//! maps with optional, null or wrongly typed keys) into [`Node`] and [`Packet`] values.
//!
//! Parsing never fails on bad input. Every field read is tolerant:
//!
//! - a missing or `null` key resolves to its documented default without complaint;
//! - a key that is present but unusable (wrong type, out of range, not a number) also resolves
//!   to the default, and a [`NormalizeIssue`] is recorded so the caller can surface it as an
//!   ERROR log event;
//! - numbers that arrive as numeric strings are accepted;
//! - a zero or missing epoch timestamp becomes "now" rather than 1970.
//!
//! The only case where nothing can be produced is a node whose id cannot be determined at
//! all; [`parse_node`] then returns [`NormalizeIssue::MissingNodeId`] and the discovery is
//! skipped by the caller.

use crate::logutil::preview;
use crate::model::{Node, NodeRef, Packet, Position};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Integer coordinates (`latitudeI`/`longitudeI`) are degrees scaled by 1e7.
const COORD_SCALE: f64 = 1e-7;
const MAX_VALUE_PREVIEW: usize = 64;

/// A problem found while normalizing a payload. Never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeIssue {
    #[error("field '{field}' has unusable value {value}")]
    Malformed { field: String, value: String },
    #[error("node entry has no usable id")]
    MissingNodeId,
    #[error("{kind} payload is not an object")]
    NotAnObject { kind: &'static str },
}

/// A normalized value plus the issues encountered while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub issues: Vec<NormalizeIssue>,
}

/// Normalize one entry of the provider's node table.
pub fn parse_node(raw_id: &str, fields: &Value) -> Result<Normalized<Node>, NormalizeIssue> {
    parse_node_at(raw_id, fields, Utc::now())
}

/// [`parse_node`] with an explicit "now" used for missing timestamps.
pub fn parse_node_at(
    raw_id: &str,
    fields: &Value,
    now: DateTime<Utc>,
) -> Result<Normalized<Node>, NormalizeIssue> {
    let mut r = FieldReader::new(fields, "node");

    let num = r.u32(&["num"]);
    let id = resolve_node_id(raw_id, num, &mut r).ok_or(NormalizeIssue::MissingNodeId)?;

    let short_name = r
        .string(&["user", "shortName"])
        .unwrap_or_else(|| format!("Node-{}", id_tail(&id, 4)));
    let long_name = r
        .string(&["user", "longName"])
        .unwrap_or_else(|| format!("Unknown Node {}", id));
    let hardware_model = r
        .string(&["user", "hwModel"])
        .unwrap_or_else(|| "Unknown".to_string());
    let role = r.string(&["user", "role"]);
    let mac_address = r.string(&["user", "macaddr"]);
    let public_key = r.string(&["user", "publicKey"]);
    let is_unmessagable = r.bool(&["user", "isUnmessagable"]);

    let position = read_position(&mut r);
    let last_heard = r.timestamp(&["lastHeard"], now);

    let node = Node {
        num,
        short_name,
        long_name,
        hardware_model,
        role,
        mac_address,
        public_key,
        is_unmessagable,
        position,
        last_heard,
        snr: r.f64(&["snr"]),
        hops_away: r.u32(&["hopsAway"]),
        battery_level: r.i64(&["deviceMetrics", "batteryLevel"]),
        voltage: r.f64(&["deviceMetrics", "voltage"]),
        channel_utilization: r.f64(&["deviceMetrics", "channelUtilization"]),
        air_util_tx: r.f64(&["deviceMetrics", "airUtilTx"]),
        uptime_seconds: r.u64(&["deviceMetrics", "uptimeSeconds"]),
        id,
    };

    Ok(Normalized {
        value: node,
        issues: r.issues,
    })
}

/// Normalize one received packet.
pub fn parse_packet(fields: &Value) -> Normalized<Packet> {
    parse_packet_at(fields, Utc::now())
}

/// [`parse_packet`] with an explicit "now" used for a missing `rxTime`.
pub fn parse_packet_at(fields: &Value, now: DateTime<Utc>) -> Normalized<Packet> {
    let mut r = FieldReader::new(fields, "packet");

    let payload = r.raw(&["decoded", "payload"]).cloned().unwrap_or(Value::Null);
    let payload_size = payload_len(&payload);

    let packet = Packet {
        id: r.u32(&["id"]).unwrap_or(0),
        from_node: r.u32(&["from"]).map(NodeRef::Num).unwrap_or(NodeRef::Unknown),
        to_node: r.u32(&["to"]).map(NodeRef::Num).unwrap_or(NodeRef::Unknown),
        from_id: r.string(&["fromId"]),
        to_id: r.string(&["toId"]),
        port_number: r
            .string(&["decoded", "portnum"])
            .unwrap_or_else(|| "Unknown".to_string()),
        payload,
        payload_size,
        text: r.string(&["decoded", "text"]),
        rx_time: r.timestamp(&["rxTime"], now),
        rx_snr: r.f64(&["rxSnr"]),
        rx_rssi: r.i32(&["rxRssi"]),
        hop_limit: r.u32(&["hopLimit"]),
        hop_start: r.u32(&["hopStart"]),
        relay_node: r.u32(&["relayNode"]),
        next_hop: r.u32(&["nextHop"]),
        channel: r.u32(&["channel"]),
        want_ack: r.bool(&["wantAck"]),
        pki_encrypted: r.bool(&["pkiEncrypted"]),
        public_key: r.string(&["publicKey"]),
        bitfield: r.u32(&["decoded", "bitfield"]),
    };

    Normalized {
        value: packet,
        issues: r.issues,
    }
}

fn resolve_node_id(raw_id: &str, num: Option<u32>, r: &mut FieldReader<'_>) -> Option<String> {
    let trimmed = raw_id.trim();
    if !trimmed.is_empty() {
        return Some(trimmed.to_string());
    }
    if let Some(user_id) = r.string(&["user", "id"]) {
        return Some(user_id);
    }
    num.map(|num| format!("!{:08x}", num))
}

fn read_position(r: &mut FieldReader<'_>) -> Option<Position> {
    let latitude = r
        .f64(&["position", "latitude"])
        .or_else(|| r.i64(&["position", "latitudeI"]).map(|v| v as f64 * COORD_SCALE))?;
    let longitude = r
        .f64(&["position", "longitude"])
        .or_else(|| r.i64(&["position", "longitudeI"]).map(|v| v as f64 * COORD_SCALE))?;
    if latitude == 0.0 || longitude == 0.0 {
        return None;
    }
    Some(Position {
        latitude,
        longitude,
        altitude: r.f64(&["position", "altitude"]).unwrap_or(0.0),
        time: r.optional_timestamp(&["position", "time"]),
        location_source: r.string(&["position", "locationSource"]),
    })
}

fn id_tail(id: &str, n: usize) -> &str {
    let count = id.chars().count();
    if count <= n {
        return id;
    }
    match id.char_indices().nth(count - n) {
        Some((idx, _)) => &id[idx..],
        None => id,
    }
}

fn payload_len(payload: &Value) -> usize {
    match payload {
        Value::Null => 0,
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        other => other.to_string().len(),
    }
}

/// Defensive accessor over a JSON field bag that records unusable values.
struct FieldReader<'a> {
    root: &'a Value,
    issues: Vec<NormalizeIssue>,
}

impl<'a> FieldReader<'a> {
    fn new(root: &'a Value, kind: &'static str) -> Self {
        let mut issues = Vec::new();
        if !root.is_object() && !root.is_null() {
            issues.push(NormalizeIssue::NotAnObject { kind });
        }
        Self { root, issues }
    }

    /// Walk `path`; `null` and missing keys both read as absent.
    fn raw(&self, path: &[&str]) -> Option<&'a Value> {
        let mut cur = self.root;
        for key in path {
            cur = cur.as_object()?.get(*key)?;
        }
        if cur.is_null() {
            None
        } else {
            Some(cur)
        }
    }

    fn malformed(&mut self, path: &[&str], value: &Value) {
        self.issues.push(NormalizeIssue::Malformed {
            field: path.join("."),
            value: preview(&value.to_string(), MAX_VALUE_PREVIEW),
        });
    }

    fn read<T>(&mut self, path: &[&str], convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
        let value = self.raw(path)?;
        let converted = convert(value);
        if converted.is_none() {
            self.malformed(path, value);
        }
        converted
    }

    /// Non-empty trimmed string; numbers are accepted and rendered.
    fn string(&mut self, path: &[&str]) -> Option<String> {
        let value = self.raw(path)?;
        match value {
            Value::String(s) => {
                let t = s.trim();
                (!t.is_empty()).then(|| t.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            other => {
                self.malformed(path, other);
                None
            }
        }
    }

    fn i64(&mut self, path: &[&str]) -> Option<i64> {
        self.read(path, value_as_i64)
    }

    fn i32(&mut self, path: &[&str]) -> Option<i32> {
        self.read(path, |v| value_as_i64(v).and_then(|n| i32::try_from(n).ok()))
    }

    fn u32(&mut self, path: &[&str]) -> Option<u32> {
        self.read(path, |v| value_as_i64(v).and_then(|n| u32::try_from(n).ok()))
    }

    fn u64(&mut self, path: &[&str]) -> Option<u64> {
        self.read(path, |v| value_as_i64(v).and_then(|n| u64::try_from(n).ok()))
    }

    fn f64(&mut self, path: &[&str]) -> Option<f64> {
        self.read(path, value_as_f64)
    }

    fn bool(&mut self, path: &[&str]) -> Option<bool> {
        self.read(path, |v| match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => s.trim().to_ascii_lowercase().parse::<bool>().ok(),
            _ => None,
        })
    }

    /// Epoch seconds. Zero, missing, or unusable values resolve to `now`.
    fn timestamp(&mut self, path: &[&str], now: DateTime<Utc>) -> DateTime<Utc> {
        self.optional_timestamp(path).unwrap_or(now)
    }

    /// Epoch seconds; zero counts as absent.
    fn optional_timestamp(&mut self, path: &[&str]) -> Option<DateTime<Utc>> {
        let secs = self.read(path, |v| value_as_f64(v).filter(|s| *s >= 0.0))?;
        if secs == 0.0 {
            return None;
        }
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        let ts = DateTime::<Utc>::from_timestamp(whole, nanos);
        if ts.is_none() {
            self.malformed(path, &Value::from(secs));
        }
        ts
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_u64()
                .and_then(|u| i64::try_from(u).ok())
                .or_else(|| n.as_f64().and_then(integral_f64))
        }),
        Value::String(s) => {
            let t = s.trim();
            t.parse::<i64>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().and_then(integral_f64))
        }
        _ => None,
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn value_as_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}
