use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent_engine::state::{AgentRunState, RunOutcome, RunStatus};

const EVENT_CAPACITY: usize = 256;

/// Everything a UI or log sink needs to follow a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged {
        status: RunStatus,
        state: AgentRunState,
    },
    StepStarted {
        step: u32,
        current_app: Option<String>,
    },
    ModelReply {
        step: u32,
        thinking: String,
        action_text: String,
    },
    ActionExecuted {
        step: u32,
        action: String,
        success: bool,
        message: Option<String>,
    },
    /// Transient conditions: retries, waiting for the target app, format corrections.
    Notice {
        message: String,
    },
    Finished {
        outcome: RunOutcome,
    },
}

/// Fan-out of [`AgentEvent`]s. Publishing never blocks and never fails;
/// slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.publish(AgentEvent::Notice {
            message: message.into(),
        });
    }
}
