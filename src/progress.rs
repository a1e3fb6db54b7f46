//! Structured progress reporting
//!
//! The pipeline emits [`ProgressEvent`]s through a [`ProgressSink`]. Sinks
//! provided here:
//! - `LogSink`: logs events through tracing
//! - `ChannelSink`: forwards events over an mpsc channel
//! - `SilentSink`: drops events
//!
//! Any `Fn(&ProgressEvent) + Send + Sync` closure is also a sink.

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::state::Stage;
use crate::summary::RunOutcome;

/// Progress of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stage started or completed
    Stage {
        run_id: String,
        stage: Stage,
        percent: u8,
        message: String,
    },
    /// The run reached its terminal outcome
    Finished { run_id: String, outcome: RunOutcome },
}

impl ProgressEvent {
    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::Stage { run_id, .. } | ProgressEvent::Finished { run_id, .. } => run_id,
        }
    }
}

/// Receives progress events; must be usable from any thread
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Logs events through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Stage {
                run_id,
                stage,
                percent,
                message,
            } => info!(%run_id, %stage, percent, "{}", message),
            ProgressEvent::Finished { run_id, outcome } if outcome.is_success() => {
                info!(%run_id, "{}", outcome.describe())
            }
            ProgressEvent::Finished { run_id, outcome } => {
                warn!(%run_id, "{}", outcome.describe())
            }
        }
    }
}

/// Forwards events over a channel; a dropped receiver is ignored
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<ProgressEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let _ = sender.send(event.clone());
    }
}
