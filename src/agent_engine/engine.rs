use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::action::coords::CoordinateMapper;
use crate::action::decoder::{ActionDecoder, DecoderConfig};
use crate::action::types::{Action, DevicePoint, ModelAction};
use crate::agent_engine::context::ConversationContext;
use crate::agent_engine::control::RunControl;
use crate::agent_engine::event_bus::{AgentEvent, EventBus};
use crate::agent_engine::history::{HistoryEntry, SessionHistory};
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::state::{AgentRunState, RunOutcome, RunStatus, StepRecord};
use crate::config::{AgentConfig, AppConfig, ImageConfig};
use crate::device::apps::AppRegistry;
use crate::device::executor::ActionExecutor;
use crate::device::traits::{Actuation, DeviceActuator, Observer};
use crate::errors::{PilotError, PilotResult};
use crate::llm::gateway::ModelGateway;
use crate::llm::prompt::{assistant_turn_text, build_system_prompt, user_turn_text, FORMAT_CORRECTION};
use crate::llm::types::{ChatMessage, Role};
use crate::perception::frame::PreparedImage;

/// Tunables for one engine, usually taken from [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub agent: AgentConfig,
    pub image: ImageConfig,
    pub decoder: DecoderConfig,
}

impl From<&AppConfig> for EngineSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            agent: cfg.agent.clone(),
            image: cfg.image.clone(),
            decoder: cfg.decoder.clone(),
        }
    }
}

/// Collaborators an engine drives.
#[derive(Clone)]
pub struct EngineParts {
    pub observer: Arc<dyn Observer>,
    pub actuator: Arc<dyn DeviceActuator>,
    pub gateway: Arc<dyn ModelGateway>,
    pub apps: AppRegistry,
}

/// What a finished run leaves behind.
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: AgentRunState,
    pub context: ConversationContext,
    pub session_id: String,
}

/// Observe → decide → act loop for a single task.
///
/// An engine is consumed by [`AgentEngine::run`]; every task gets a fresh
/// engine, run state and conversation.
pub struct AgentEngine {
    settings: EngineSettings,
    observer: Arc<dyn Observer>,
    executor: ActionExecutor,
    gateway: Arc<dyn ModelGateway>,
    decoder: ActionDecoder,
    control: RunControl,
    events: EventBus,
    state: AgentRunState,
    state_tx: watch::Sender<AgentRunState>,
    limits: LoopController,
    context: ConversationContext,
    history: SessionHistory,
    emulator: Option<bool>,
}

impl AgentEngine {
    pub fn new(settings: EngineSettings, parts: EngineParts, control: RunControl, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(AgentRunState::new());
        let system = build_system_prompt(chrono::Local::now().date_naive());
        Self {
            decoder: ActionDecoder::new(&settings.decoder),
            limits: LoopController::new(&settings.agent),
            executor: ActionExecutor::new(parts.actuator, parts.apps),
            observer: parts.observer,
            gateway: parts.gateway,
            control,
            events,
            state: AgentRunState::new(),
            state_tx,
            context: ConversationContext::with_system(system),
            history: SessionHistory::in_memory(),
            emulator: None,
            settings,
        }
    }

    pub fn with_history(mut self, history: SessionHistory) -> Self {
        self.history = history;
        self
    }

    /// Read-only projection of the run state, updated on every change.
    pub fn state_watch(&self) -> watch::Receiver<AgentRunState> {
        self.state_tx.subscribe()
    }

    pub async fn run(mut self, task: &str) -> RunReport {
        tracing::info!(
            session = %self.history.session_id,
            gateway = self.gateway.name(),
            task = %task,
            "run started"
        );
        self.set_status(RunStatus::Running);
        self.record_history("user", Some(task.to_string()), None);

        let outcome = match self.drive(task).await {
            Ok(outcome) => outcome,
            Err(PilotError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed {
                reason: e.to_string(),
            },
        };

        if outcome != RunOutcome::Cancelled {
            self.executor.actuator().bring_to_foreground().await;
        }
        self.set_status(outcome.status());

        match &outcome {
            RunOutcome::Completed { message } => {
                tracing::info!(steps = self.state.step_index, message = %message, "run completed")
            }
            RunOutcome::Failed { reason } => {
                tracing::error!(steps = self.state.step_index, reason = %reason, "run failed")
            }
            RunOutcome::Cancelled => tracing::info!(steps = self.state.step_index, "run cancelled"),
        }
        self.events.publish(AgentEvent::Finished {
            outcome: outcome.clone(),
        });

        RunReport {
            outcome,
            state: self.state.clone(),
            session_id: self.history.session_id.clone(),
            context: self.context,
        }
    }

    async fn drive(&mut self, task: &str) -> PilotResult<RunOutcome> {
        let agent = self.settings.agent.clone();

        loop {
            self.pause_point().await?;
            if self.limits.steps_exhausted(&self.state) {
                return Ok(RunOutcome::Failed {
                    reason: format!("step limit of {} reached", self.limits.max_steps()),
                });
            }

            let step = self.state.step_index;
            let step_started = Instant::now();

            let current_app = self.observer.current_app().await;
            let on_host = is_host_app(agent.host_app.as_deref(), current_app.as_deref());
            if on_host && step > 0 {
                tracing::info!(step, "host app in the foreground, waiting");
                self.events
                    .notice("waiting for the target app to return to the foreground");
                self.control.sleep(agent.self_observation_delay()).await?;
                continue;
            }

            self.events.publish(AgentEvent::StepStarted {
                step,
                current_app: current_app.clone(),
            });

            let shot_started = Instant::now();
            // The host app is never sent; the first turn goes out as text only.
            let prepared = if on_host { None } else { Some(self.observe().await?) };
            let screenshot_ms = elapsed_ms(shot_started);

            let first_turn = !self.context.messages().iter().any(|m| m.role == Role::User);
            let text = user_turn_text(first_turn.then_some(task), current_app.as_deref());
            let user_msg = match &prepared {
                Some(img) => ChatMessage::user_with_image(img.data_url.clone(), text),
                None => ChatMessage::user(text),
            };

            let model_started = Instant::now();
            let outgoing = self.context.outgoing(&user_msg);
            let raw = self.request_with_retry(&outgoing).await?;
            let model_ms = elapsed_ms(model_started);

            self.context.append(user_msg);
            let decoded = self.decoder.decode_response(&raw);
            self.context.append(ChatMessage::assistant(assistant_turn_text(
                &decoded.thinking,
                &decoded.action_text,
            )));
            self.record_history("assistant", Some(raw), None);
            self.events.publish(AgentEvent::ModelReply {
                step,
                thinking: decoded.thinking.clone(),
                action_text: decoded.action_text.clone(),
            });

            let action = match decoded.action {
                Ok(action) => {
                    self.limits.record_format_success();
                    action
                }
                Err(e) => {
                    tracing::warn!(step, error = %e, "model reply could not be decoded");
                    if self.limits.record_format_failure() {
                        return Err(e.into());
                    }
                    self.events
                        .notice(format!("reply not understood ({e}), asking for a corrected one"));
                    self.context.append(ChatMessage::user(FORMAT_CORRECTION));
                    continue;
                }
            };

            if let Action::Finish { message } = action {
                return Ok(RunOutcome::Completed { message });
            }

            let name = action.name();
            let action_json = serde_json::to_value(&action).ok();
            let act_started = Instant::now();
            let result = self.actuate(action, prepared.as_ref()).await?;
            let actuation_ms = elapsed_ms(act_started);

            self.context.record_step(StepRecord {
                index: step,
                screenshot_ms,
                model_ms,
                actuation_ms,
                total_ms: elapsed_ms(step_started),
                image_dims: prepared.as_ref().map(|p| p.dims),
                original_dims: prepared.as_ref().map(|p| p.original_dims),
                image_bytes: prepared.as_ref().map_or(0, |p| p.bytes),
            });
            self.record_history("action", result.message.clone(), action_json);
            self.events.publish(AgentEvent::ActionExecuted {
                step,
                action: name.to_string(),
                success: result.success,
                message: result.message.clone(),
            });

            if !result.success {
                let stop = self.limits.record_action_failure(&mut self.state);
                self.publish_state();
                if stop {
                    return Ok(RunOutcome::Failed {
                        reason: format!(
                            "{name} failed {} times in a row: {}",
                            self.state.retry_count,
                            result.describe()
                        ),
                    });
                }
                self.events.notice(format!(
                    "{name} failed ({}), retry {}/{}",
                    result.describe(),
                    self.state.retry_count,
                    agent.max_action_retries
                ));
                self.control.sleep(agent.settle_delay()).await?;
                continue;
            }

            self.limits.record_action_success(&mut self.state);
            self.publish_state();
            self.control.sleep(agent.settle_delay()).await?;
        }
    }

    /// Capture, validate and encode the current screen.
    async fn observe(&mut self) -> PilotResult<PreparedImage> {
        let frame = self
            .observer
            .screenshot()
            .await
            .ok_or_else(|| PilotError::Environment("screen capture is unavailable".into()))?;

        let threshold = self.settings.agent.blank_threshold;
        if frame.is_blank(threshold) {
            if self.is_emulator().await {
                tracing::warn!(ratio = frame.black_ratio(), "blank frame accepted from emulator");
            } else {
                return Err(PilotError::Environment(
                    "screenshot is blank; the screen may be off or capture may be blocked".into(),
                ));
            }
        }

        let img = frame.prepare(self.settings.image.scale_factor, self.settings.image.jpeg_quality)?;
        tracing::debug!(
            width = img.dims.width,
            height = img.dims.height,
            scaled = img.was_scaled(),
            bytes = img.bytes,
            "screen captured"
        );
        Ok(img)
    }

    async fn is_emulator(&mut self) -> bool {
        match self.emulator {
            Some(known) => known,
            None => {
                let known = self.observer.is_emulator().await;
                self.emulator = Some(known);
                known
            }
        }
    }

    /// Call the model, retrying transport failures a bounded number of times.
    async fn request_with_retry(&self, messages: &[ChatMessage]) -> PilotResult<String> {
        let agent = &self.settings.agent;
        let mut attempt = 0;
        loop {
            match self.control.guard(self.gateway.request(messages)).await? {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transport() && attempt < agent.max_transport_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "model request failed, retrying");
                    self.events.notice(format!(
                        "model request failed, retry {attempt}/{}",
                        agent.max_transport_retries
                    ));
                    self.control.sleep(agent.transport_retry_delay()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map model coordinates onto the image that was sent and execute.
    async fn actuate(&self, action: ModelAction, image: Option<&PreparedImage>) -> PilotResult<Actuation> {
        if let Action::Wait { duration } = action {
            tracing::info!(secs = duration.as_secs_f64(), "waiting");
            self.control.sleep(duration).await?;
            return Ok(Actuation::ok());
        }

        let device_action = match image {
            Some(img) => CoordinateMapper::new(img.dims)?.map_action(action),
            None if action.needs_coordinates() => {
                return Ok(Actuation::failed("no screenshot to map coordinates onto"));
            }
            // No points to convert.
            None => action.map_points(|p| DevicePoint::new(p.x(), p.y())),
        };
        Ok(self.executor.execute(&device_action).await)
    }

    async fn pause_point(&mut self) -> PilotResult<()> {
        self.control.check()?;
        if self.control.is_paused() {
            tracing::info!(step = self.state.step_index, "run paused");
            self.set_status(RunStatus::Paused);
        }
        let waited = self.control.wait_if_paused().await?;
        if self.state.status == RunStatus::Paused {
            self.set_status(RunStatus::Running);
        }
        if waited {
            tracing::info!(step = self.state.step_index, "run resumed");
        }
        Ok(())
    }

    fn set_status(&mut self, next: RunStatus) {
        if self.state.status == next {
            return;
        }
        if let Err(e) = self.state.transition(next) {
            tracing::warn!(error = %e, "status change ignored");
            return;
        }
        self.publish_state();
        self.events.publish(AgentEvent::StatusChanged {
            status: next,
            state: self.state.clone(),
        });
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn record_history(&mut self, role: &str, content: Option<String>, action: Option<serde_json::Value>) {
        if let Err(e) = self.history.push(HistoryEntry::new(role, content, action)) {
            tracing::warn!(error = %e, "history entry not written");
        }
    }
}

fn is_host_app(host: Option<&str>, current: Option<&str>) -> bool {
    matches!((host, current), (Some(h), Some(c)) if h == c)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_app_needs_both_sides() {
        assert!(is_host_app(Some("com.example.pilot"), Some("com.example.pilot")));
        assert!(!is_host_app(Some("com.example.pilot"), Some("com.android.settings")));
        assert!(!is_host_app(None, Some("com.example.pilot")));
        assert!(!is_host_app(Some("com.example.pilot"), None));
    }
}
