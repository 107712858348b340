//! Connection Health Module
//!
//! Supervises the remote connection. Every remote call goes through
//! [`ConnectionHealthMonitor::call`], which refuses work once the remote SDK
//! has reported an internal fault.
//!
//! # States
//! - `Healthy` - last remote call succeeded
//! - `Degraded(n)` - `n` consecutive transient failures
//! - `Corrupted` - terminal for the process; a full client reset is required

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{RemoteError, Result, SyncError};

// == Connection State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "retry_count", rename_all = "snake_case")]
pub enum ConnectionState {
    Healthy,
    Degraded(u32),
    Corrupted,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Healthy => "healthy",
            ConnectionState::Degraded(_) => "degraded",
            ConnectionState::Corrupted => "corrupted",
        }
    }
}

// == Monitor ==
/// Process-wide connection supervisor, shared by reference.
#[derive(Debug)]
pub struct ConnectionHealthMonitor {
    state: watch::Sender<ConnectionState>,
    recovery: watch::Sender<bool>,
    recovery_prompts: AtomicU64,
}

impl Default for ConnectionHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHealthMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Healthy);
        let (recovery, _) = watch::channel(false);
        Self {
            state,
            recovery,
            recovery_prompts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_corrupted(&self) -> bool {
        self.state() == ConnectionState::Corrupted
    }

    /// Flips to `true` exactly once, when the connection becomes corrupted.
    pub fn recovery_signal(&self) -> watch::Receiver<bool> {
        self.recovery.subscribe()
    }

    /// Number of reset prompts emitted. Never exceeds one.
    pub fn recovery_prompts(&self) -> u64 {
        self.recovery_prompts.load(Ordering::SeqCst)
    }

    /// Fails with [`SyncError::Corrupted`] once remote work has been halted.
    pub fn ensure_available(&self) -> Result<()> {
        if self.is_corrupted() {
            return Err(SyncError::Corrupted(
                "remote operations halted until the client is reset".to_string(),
            ));
        }
        Ok(())
    }

    // == Guarded Call ==
    /// Runs one remote operation, translating its error and recording the
    /// outcome. The future is never polled once the connection is corrupted.
    pub async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        self.ensure_available()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(remote) => {
                let err = SyncError::from(remote);
                warn!("Remote {} failed: {}", operation, err);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    // == Transitions ==
    /// A remote call succeeded.
    pub fn record_success(&self) {
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Degraded(n) => {
                info!("Remote connection recovered after {} failures", n);
                *state = ConnectionState::Healthy;
                true
            }
            _ => false,
        });
    }

    /// A remote call failed. Only transient failures and internal faults move
    /// the state; permission and lookup errors say nothing about the link.
    pub fn record_error(&self, err: &SyncError) {
        match err {
            SyncError::Transient(_) => self.record_transient(),
            SyncError::Corrupted(reason) => self.report_corrupted(reason),
            _ => {}
        }
    }

    fn record_transient(&self) {
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Healthy => {
                *state = ConnectionState::Degraded(1);
                true
            }
            ConnectionState::Degraded(n) => {
                *state = ConnectionState::Degraded(n.saturating_add(1));
                true
            }
            ConnectionState::Corrupted => false,
        });
    }

    /// Enters the terminal `Corrupted` state and emits the reset prompt the
    /// first time only.
    pub fn report_corrupted(&self, reason: &str) {
        let became_corrupted = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Corrupted {
                return false;
            }
            *state = ConnectionState::Corrupted;
            true
        });

        if became_corrupted {
            error!(
                "Remote connection corrupted ({}); halting remote operations, client reset required",
                reason
            );
            self.recovery_prompts.fetch_add(1, Ordering::SeqCst);
            self.recovery.send_replace(true);
        }
    }
}
