//! # Connection Manager
//!
//! Owns the lifecycle of at most one transport connection and the single background worker
//! that services it.
//!
//! ## State machine
//!
//! ```text
//!   Idle ──connect──► Connecting ──open ok──► Connected
//!                       │      │                  │
//!              open err │      │ disconnect       │ disconnect / stream end
//!                       ▼      ▼                  ▼
//!                    Failed   Disconnected ◄──────┘
//!
//!   Failed | Disconnected ──connect──► Connecting
//! ```
//!
//! Requests that do not match a legal edge are no-ops: `connect` while `Connecting` or
//! `Connected`, `disconnect` while `Idle`, `Failed` or `Disconnected`.
//!
//! ## Threading
//!
//! [`ConnectionManager::connect`] returns immediately after spawning the worker; the outcome
//! arrives as a `connectionStatusChanged` event. The worker runs on the runtime the manager
//! was built in (or the one given to [`ConnectionManager::with_runtime`]), so `connect` may be
//! called from threads that are not part of any runtime.
//! [`ConnectionManager::disconnect`] signals the worker and waits for it to exit (bounded by
//! [`ManagerTuning::shutdown_timeout`], after which the task is aborted), so no event from the
//! old connection is published once it returns.
//!
//! State changes are applied and their status event published under one lock, so an observer
//! that sees `Failed` or `Disconnected` has already been sent the matching status event.

mod worker;

use crate::broadcast::EventBroadcaster;
use crate::model::{ConnectionState, ConnectionStatus, LogLevel};
use crate::transport::{ConnectParams, TransportKind, TransportProvider, TransportTarget};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use crate::transport::ConnectError;

/// Manager tuning parameters, typically sourced from Config.
#[derive(Debug, Clone)]
pub struct ManagerTuning {
    /// How long `disconnect` waits for the worker before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_millis(200),
        }
    }
}

/// State shared between the manager and its worker.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    events: EventBroadcaster,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.lock().clone()
    }

    /// Move to `next` if the edge is legal, publishing `status` atomically with the change.
    fn transition(&self, next: ConnectionState, status: Option<ConnectionStatus>) -> bool {
        let mut state = self.lock();
        if !state.can_transition_to(&next) {
            debug!("ignoring transition {} -> {}", *state, next);
            return false;
        }
        debug!("connection state {} -> {}", *state, next);
        *state = next;
        if let Some(status) = status {
            self.events.connection_status().publish(status);
        }
        true
    }
}

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct ConnectionManager {
    provider: Arc<dyn TransportProvider>,
    shared: Arc<Shared>,
    tuning: ManagerTuning,
    target: Option<TransportTarget>,
    worker: Option<WorkerHandle>,
    runtime: Option<Handle>,
}

impl ConnectionManager {
    pub fn new(provider: Arc<dyn TransportProvider>, events: EventBroadcaster) -> Self {
        Self {
            provider,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Idle),
                events,
            }),
            tuning: ManagerTuning::default(),
            target: None,
            worker: None,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_tuning(mut self, tuning: ManagerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Run the connection worker on `runtime`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Read-only view of the current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Target of the current or most recent connection attempt.
    pub fn target(&self) -> Option<&TransportTarget> {
        self.target.as_ref()
    }

    /// Validate `kind`/`params` and start connecting in the background.
    ///
    /// A validation failure moves the manager to `Failed`, emits
    /// `connectionStatusChanged(false, reason)` and is also returned. A request while already
    /// connecting or connected is ignored.
    pub fn connect(&mut self, kind: &str, params: &ConnectParams) -> Result<(), ConnectError> {
        if self.ignore_if_active() {
            return Ok(());
        }
        let target = kind
            .parse::<TransportKind>()
            .and_then(|kind| TransportTarget::resolve(kind, params))
            .map_err(|e| self.reject(e))?;
        self.connect_target(target)
    }

    /// Start connecting to an already validated target.
    ///
    /// Fails with [`ConnectError::NoRuntime`] if the manager was built outside a Tokio
    /// runtime and none was supplied through [`ConnectionManager::with_runtime`].
    pub fn connect_target(&mut self, target: TransportTarget) -> Result<(), ConnectError> {
        if self.ignore_if_active() {
            return Ok(());
        }
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            return Err(self.reject(ConnectError::NoRuntime));
        };
        if let Some(previous) = self.worker.take() {
            // Already past its final transition; let it finish unobserved.
            drop(previous.join);
        }
        if !self.shared.transition(ConnectionState::Connecting, None) {
            return Ok(());
        }
        self.shared
            .events
            .log(LogLevel::Info, format!("Connecting via {}", target));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker::Worker::new(
            self.provider.clone(),
            self.shared.clone(),
            target.clone(),
            shutdown_rx,
        );
        let join = runtime.spawn(worker.run());
        self.target = Some(target);
        self.worker = Some(WorkerHandle {
            shutdown: shutdown_tx,
            join,
        });
        Ok(())
    }

    /// Stop the worker, close the transport and wait until the worker has exited.
    /// Safe to call in any state.
    pub async fn disconnect(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            debug!("disconnect requested with no active connection");
            return;
        };
        let _ = worker.shutdown.send(true);
        if tokio::time::timeout(self.tuning.shutdown_timeout, &mut worker.join)
            .await
            .is_err()
        {
            warn!(
                "connection worker did not stop within {:?}; aborting",
                self.tuning.shutdown_timeout
            );
            worker.join.abort();
            let _ = worker.join.await;
        }
        // Covers a worker that was aborted before its own teardown ran.
        self.shared.transition(
            ConnectionState::Disconnected,
            Some(ConnectionStatus::down("Disconnected")),
        );
    }

    fn ignore_if_active(&self) -> bool {
        let state = self.shared.state();
        if state.is_active() {
            self.shared.events.log(
                LogLevel::Warn,
                format!("Connect request ignored: connection already {}", state),
            );
            return true;
        }
        false
    }

    fn reject(&self, err: ConnectError) -> ConnectError {
        let reason = err.to_string();
        crate::metrics::inc_connect_failures();
        self.shared.transition(ConnectionState::Connecting, None);
        self.shared
            .events
            .log(LogLevel::Error, format!("Connection error: {}", reason));
        self.shared.transition(
            ConnectionState::Failed(reason.clone()),
            Some(ConnectionStatus::down(reason)),
        );
        err
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            let _ = worker.shutdown.send(true);
        }
    }
}
