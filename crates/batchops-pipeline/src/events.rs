//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! in-process observers (progress output, metrics collectors, tests) can
//! follow a run without coupling to the executor internals.

use serde::{Deserialize, Serialize};

/// Events emitted while a run is executed or resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    PassStarted {
        run_id: String,
        start_index: usize,
        stage_count: usize,
    },
    StageRebuilt {
        stage: String,
        duration_ms: u64,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    StageCompleted {
        stage: String,
        duration_ms: u64,
    },
    StageFailed {
        stage: String,
        error: String,
        domain: bool,
    },
    CheckpointSaved {
        stage: String,
        status: String,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        stage: String,
    },
    RunCancelled {
        run_id: String,
        next_stage: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
