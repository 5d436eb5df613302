//! Event types and fan-out for restore progress.
//!
//! Backend components publish events; the CLI (or any other front end)
//! subscribes. Every subscriber owns its own unbounded queue, so events reach
//! each of them in emission order and a slow subscriber never drops messages.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::restore::RestoreOutcome;

/// Observer registry with one single-consumer queue per subscriber.
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: E) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which part of a job a per-job progress value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Extract,
    Restore,
}

/// Events emitted while restoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum RestoreEvent {
    /// "Restoring backup i of N." (only for batches of more than one job)
    #[serde(rename = "restore:header:all")]
    HeaderAll(String),

    #[serde(rename = "restore:header:current")]
    HeaderCurrent(String),

    #[serde(rename = "restore:status")]
    StatusCurrent(String),

    /// Per-job progress, 0-100, non-decreasing within a phase.
    #[serde(rename = "restore:progress")]
    ProgressCurrent { phase: ProgressPhase, percent: u8 },

    #[serde(rename = "restore:progress:all:max")]
    ProgressAllMax(usize),

    #[serde(rename = "restore:progress:all")]
    ProgressAll(usize),

    #[serde(rename = "restore:success")]
    JobSucceeded { filename: String },

    #[serde(rename = "restore:failure")]
    JobFailed { filename: String, errors: Vec<String> },

    #[serde(rename = "restore:finished")]
    JobFinished(RestoreOutcome),

    #[serde(rename = "restore:complete")]
    BatchComplete { outcomes: Vec<RestoreOutcome> },
}
