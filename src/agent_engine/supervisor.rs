use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::agent_engine::control::RunControl;
use crate::agent_engine::engine::{AgentEngine, EngineParts, EngineSettings, RunReport};
use crate::agent_engine::event_bus::{AgentEvent, EventBus};
use crate::agent_engine::history::SessionHistory;
use crate::agent_engine::state::AgentRunState;

struct ActiveRun {
    control: RunControl,
    state: watch::Receiver<AgentRunState>,
    done: watch::Receiver<Option<Arc<RunReport>>>,
    handle: JoinHandle<()>,
}

/// Owns at most one running task at a time.
///
/// Starting a task cancels the previous one and waits for it to finish
/// before the new run begins, so two loops never drive the device at once.
pub struct AgentSupervisor {
    settings: EngineSettings,
    parts: EngineParts,
    events: EventBus,
    current: Mutex<Option<ActiveRun>>,
}

impl AgentSupervisor {
    pub fn new(settings: EngineSettings, parts: EngineParts) -> Self {
        Self {
            settings,
            parts,
            events: EventBus::new(),
            current: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self, task: impl Into<String>) {
        let task = task.into();
        let mut current = self.current.lock().await;

        if let Some(prev) = current.take() {
            if !prev.handle.is_finished() {
                tracing::info!("cancelling the previous run");
            }
            prev.control.cancel();
            if let Err(e) = prev.handle.await {
                tracing::warn!(error = %e, "previous run ended abnormally");
            }
        }

        let history = if self.settings.agent.record_sessions {
            SessionHistory::persistent()
        } else {
            SessionHistory::in_memory()
        };
        let control = RunControl::new();
        let engine = AgentEngine::new(
            self.settings.clone(),
            self.parts.clone(),
            control.clone(),
            self.events.clone(),
        )
        .with_history(history);
        let state = engine.state_watch();
        let (done_tx, done) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let report = engine.run(&task).await;
            done_tx.send_replace(Some(Arc::new(report)));
        });

        *current = Some(ActiveRun {
            control,
            state,
            done,
            handle,
        });
    }

    /// Takes effect at the next step boundary. Returns `false` with no run.
    pub async fn pause(&self) -> bool {
        self.with_control(RunControl::pause).await
    }

    pub async fn resume(&self) -> bool {
        self.with_control(RunControl::resume).await
    }

    /// New pause flag, or `None` with no run.
    pub async fn toggle_pause(&self) -> Option<bool> {
        let current = self.current.lock().await;
        current.as_ref().map(|run| run.control.toggle_pause())
    }

    /// Cancel the current run. It stops at its next suspension point.
    pub async fn stop(&self) -> bool {
        self.with_control(RunControl::cancel).await
    }

    /// Latest state of the current or last run.
    pub async fn status(&self) -> Option<AgentRunState> {
        let current = self.current.lock().await;
        current.as_ref().map(|run| run.state.borrow().clone())
    }

    /// Wait for the current run to end.
    pub async fn wait(&self) -> Option<Arc<RunReport>> {
        let mut done = {
            let current = self.current.lock().await;
            current.as_ref()?.done.clone()
        };
        let report = match done.wait_for(|r| r.is_some()).await {
            Ok(report) => report.clone(),
            Err(_) => {
                tracing::error!("run task ended without a report");
                None
            }
        };
        report
    }

    async fn with_control(&self, f: impl FnOnce(&RunControl)) -> bool {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(run) => {
                f(&run.control);
                true
            }
            None => false,
        }
    }
}
