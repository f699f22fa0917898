//! Run event system for observability.
//!
//! Mirrors the step state machine in [`crate::state`] as a broadcast stream
//! external observers (the CLI's `--verbose` logging, tests) can subscribe
//! to without coupling to orchestrator internals.

use serde::{Deserialize, Serialize};

/// Events emitted during a plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    PlanStarted { plan_name: String, step_count: usize },
    StepStarted { step: String },
    StepSkipped { step: String },
    StepSucceeded { step: String },
    StepFailed { step: String, error: String },
    CleanupStarted { step: String },
    CleanupSucceeded { step: String },
    CleanupFailed { step: String, error: String },
    PlanCompleted { plan_name: String, completed_steps: Vec<String> },
    PlanFailed { plan_name: String, error: String },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped silently if no one
    /// is listening.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
