//! Cooperative cancellation and pause signals
//!
//! A [`FlowControl`] travels with a flow from the scheduler into the executor and
//! down to every task attempt. Nothing is pre-empted: executors and backends check
//! the signals at their suspension points and stop on their own.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Why a flow was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// `CancelFlow` was called
    Requested,
    /// The flow-level timeout expired
    FlowTimeout,
    /// The orchestrator is stopping
    Shutdown,
}

/// Cloneable cancellation signal; the first reason recorded wins
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Returns `false` if already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as `self`, so this never fires in practice
                return std::future::pending().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Gate checked by the executor before each task attempt
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `false` if already paused
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    /// Returns `false` if not paused
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until resumed. Returns `false` if cancellation arrived first.
    pub async fn wait_resumed(&self, cancel: &CancelSignal) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-flow control handles shared by the orchestrator and the executor
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    pub cancel: CancelSignal,
    pub pause: PauseGate,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }
}
