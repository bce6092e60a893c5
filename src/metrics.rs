//! Process-wide ingestion counters.
//!
//! Counters are plain atomics so the connection worker and subscriber tasks can bump them
//! without coordination. [`snapshot`] reads them all for the CLI summary.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static NODES_DISCOVERED: AtomicU64 = AtomicU64::new(0);
static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static NORMALIZE_ISSUES: AtomicU64 = AtomicU64::new(0);
static CONNECT_FAILURES: AtomicU64 = AtomicU64::new(0);
static HANDLER_PANICS: AtomicU64 = AtomicU64::new(0);

pub fn inc_nodes_discovered() {
    NODES_DISCOVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_packets_received() {
    PACKETS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_normalize_issues() {
    NORMALIZE_ISSUES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_connect_failures() {
    CONNECT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

/// Handler or subscriber callback that panicked and was isolated.
pub fn inc_handler_panics() {
    HANDLER_PANICS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub nodes_discovered: u64,
    pub packets_received: u64,
    pub normalize_issues: u64,
    pub connect_failures: u64,
    pub handler_panics: u64,
}

pub fn snapshot() -> IngestStats {
    IngestStats {
        nodes_discovered: NODES_DISCOVERED.load(Ordering::Relaxed),
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        normalize_issues: NORMALIZE_ISSUES.load(Ordering::Relaxed),
        connect_failures: CONNECT_FAILURES.load(Ordering::Relaxed),
        handler_panics: HANDLER_PANICS.load(Ordering::Relaxed),
    }
}
