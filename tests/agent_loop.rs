use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use tokio::sync::Notify;

use phonepilot::action::types::DevicePoint;
use phonepilot::agent_engine::control::RunControl;
use phonepilot::agent_engine::event_bus::{AgentEvent, EventBus};
use phonepilot::agent_engine::state::{RunOutcome, RunStatus};
use phonepilot::device::apps::AppRegistry;
use phonepilot::device::traits::{Actuation, DeviceActuator, Observer};
use phonepilot::llm::gateway::ModelGateway;
use phonepilot::llm::prompt::{FORMAT_CORRECTION, SCREEN_INFO_MARKER};
use phonepilot::llm::types::{ChatMessage, Role};
use phonepilot::perception::frame::ScreenFrame;
use phonepilot::{AgentEngine, AgentSupervisor, EngineParts, EngineSettings, PilotError, PilotResult, RunReport};

const TAP_CENTER: &str = r#"<think>The button is in the middle.</think><answer>do(action="Tap", element=[500,500])</answer>"#;
const BACK: &str = r#"<think>Go back.</think><answer>do(action="Back")</answer>"#;
const FINISH: &str = r#"<think>All set.</think><answer>finish(message="done")</answer>"#;
const HOST_APP: &str = "com.example.pilot";
const TARGET_APP: &str = "com.android.settings";

// ---- fakes ---------------------------------------------------------------

struct FakePhone {
    frame: Option<ScreenFrame>,
    apps: Mutex<VecDeque<String>>,
    emulator: bool,
    failing_taps: AtomicU32,
    screenshots: AtomicU32,
    foreground: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl FakePhone {
    fn with_frame(frame: Option<ScreenFrame>) -> Self {
        Self {
            frame,
            apps: Mutex::new(VecDeque::new()),
            emulator: false,
            failing_taps: AtomicU32::new(0),
            screenshots: AtomicU32::new(0),
            foreground: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn new() -> Self {
        let white = RgbImage::from_pixel(100, 200, Rgb([255, 255, 255]));
        Self::with_frame(Some(ScreenFrame::new(DynamicImage::ImageRgb8(white))))
    }

    fn black() -> Self {
        Self::with_frame(Some(ScreenFrame::new(DynamicImage::ImageRgb8(RgbImage::new(100, 200)))))
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Actuation {
        self.calls.lock().unwrap().push(call);
        Actuation::ok()
    }

    fn screenshots(&self) -> u32 {
        self.screenshots.load(Ordering::SeqCst)
    }

    fn foreground_calls(&self) -> u32 {
        self.foreground.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Observer for FakePhone {
    async fn screenshot(&self) -> Option<ScreenFrame> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        self.frame.clone()
    }

    async fn current_app(&self) -> Option<String> {
        let queued = self.apps.lock().unwrap().pop_front();
        Some(queued.unwrap_or_else(|| TARGET_APP.to_string()))
    }

    async fn is_emulator(&self) -> bool {
        self.emulator
    }
}

#[async_trait]
impl DeviceActuator for FakePhone {
    async fn tap(&self, point: DevicePoint) -> Actuation {
        let fail = self
            .failing_taps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            self.calls.lock().unwrap().push(format!("tap {point} (failed)"));
            return Actuation::failed("element not found");
        }
        self.record(format!("tap {point}"))
    }
    async fn long_press(&self, point: DevicePoint) -> Actuation {
        self.record(format!("long_press {point}"))
    }
    async fn swipe(&self, from: DevicePoint, to: DevicePoint) -> Actuation {
        self.record(format!("swipe {from} {to}"))
    }
    async fn set_text(&self, text: &str) -> Actuation {
        self.record(format!("text {text}"))
    }
    async fn back(&self) -> Actuation {
        self.record("back".into())
    }
    async fn home(&self) -> Actuation {
        self.record("home".into())
    }
    async fn launch(&self, app_id: &str) -> Actuation {
        self.record(format!("launch {app_id}"))
    }
    async fn find_by_label(&self, _label: &str) -> Option<DevicePoint> {
        None
    }
    async fn bring_to_foreground(&self) {
        self.foreground.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<VecDeque<PilotResult<String>>>,
    fallback: Option<String>,
    hang: bool,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    started: Notify,
}

impl ScriptedGateway {
    fn replying(replies: impl IntoIterator<Item = PilotResult<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    fn texts(replies: &[&str]) -> Self {
        Self::replying(replies.iter().map(|r| Ok(r.to_string())))
    }

    fn always(reply: &str) -> Self {
        Self {
            fallback: Some(reply.to_string()),
            ..Self::default()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn request(&self, messages: &[ChatMessage]) -> PilotResult<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.started.notify_one();
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => match &self.fallback {
                Some(reply) => Ok(reply.clone()),
                None => Err(PilotError::Agent("script exhausted".into())),
            },
        }
    }
}

// ---- helpers -------------------------------------------------------------

fn settings() -> EngineSettings {
    let mut s = EngineSettings::default();
    s.agent.transport_retry_delay_ms = 0;
    s.agent.settle_delay_ms = 0;
    s.agent.self_observation_delay_ms = 0;
    s.agent.record_sessions = false;
    s
}

fn parts(phone: &Arc<FakePhone>, gateway: &Arc<ScriptedGateway>) -> EngineParts {
    EngineParts {
        observer: phone.clone(),
        actuator: phone.clone(),
        gateway: gateway.clone(),
        apps: AppRegistry::builtin(),
    }
}

async fn run_with(settings: EngineSettings, phone: &Arc<FakePhone>, gateway: &Arc<ScriptedGateway>, events: EventBus) -> RunReport {
    AgentEngine::new(settings, parts(phone, gateway), RunControl::new(), events)
        .run("open settings")
        .await
}

async fn run(phone: &Arc<FakePhone>, gateway: &Arc<ScriptedGateway>) -> RunReport {
    run_with(settings(), phone, gateway, EventBus::new()).await
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn failed_reason(report: &RunReport) -> &str {
    match &report.outcome {
        RunOutcome::Failed { reason } => reason,
        other => panic!("expected failure, got {other:?}"),
    }
}

// ---- scenarios -----------------------------------------------------------

#[tokio::test]
async fn failed_taps_are_retried_against_fresh_screens() {
    let phone = Arc::new(FakePhone::new());
    phone.failing_taps.store(3, Ordering::SeqCst);
    let gateway = Arc::new(ScriptedGateway::texts(&[TAP_CENTER, TAP_CENTER, TAP_CENTER, TAP_CENTER, FINISH]));
    let events = EventBus::new();
    let mut rx = events.subscribe();

    let report = run_with(settings(), &phone, &gateway, events).await;

    assert_eq!(report.outcome, RunOutcome::Completed { message: "done".into() });
    // 4 tap attempts plus the finishing turn, each with its own screenshot
    assert_eq!(phone.screenshots(), 5);
    assert_eq!(gateway.requests().len(), 5);
    assert_eq!(
        phone.calls(),
        vec![
            "tap (50.0,100.0) (failed)",
            "tap (50.0,100.0) (failed)",
            "tap (50.0,100.0) (failed)",
            "tap (50.0,100.0)",
        ]
    );
    assert_eq!(report.state.step_index, 1);
    assert_eq!(report.state.retry_count, 0);

    let results: Vec<bool> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::ActionExecuted { success, .. } => Some(success),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec![false, false, false, true]);
}

#[tokio::test]
async fn too_many_consecutive_failures_fail_the_run() {
    let phone = Arc::new(FakePhone::new());
    phone.failing_taps.store(100, Ordering::SeqCst);
    let gateway = Arc::new(ScriptedGateway::always(TAP_CENTER));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("element not found"));
    assert_eq!(phone.calls().len(), 10);
    assert_eq!(report.state.retry_count, 10);
    assert_eq!(phone.foreground_calls(), 1);
}

#[tokio::test]
async fn finish_returns_to_foreground_without_actuating() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&[r#"{"_metadata":"finish","message":"任务完成"}"#]));

    let report = run(&phone, &gateway).await;

    assert_eq!(report.outcome, RunOutcome::Completed { message: "任务完成".into() });
    assert_eq!(report.state.status, RunStatus::Completed);
    assert_eq!(phone.foreground_calls(), 1);
    assert!(phone.calls().is_empty());
}

#[tokio::test]
async fn step_cap_stops_at_fifty_actions() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::always(BACK));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("step limit of 50"));
    assert_eq!(report.state.step_index, 50);
    assert_eq!(phone.calls().len(), 50);
    assert_eq!(gateway.requests().len(), 50);
    assert_eq!(phone.foreground_calls(), 1);
}

#[tokio::test]
async fn first_turn_carries_the_task_and_later_turns_the_marker() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&[BACK, BACK, FINISH]));

    let report = run(&phone, &gateway).await;
    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));

    let requests = gateway.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0][0].role, Role::System);
    assert!(requests[0][1].text().starts_with("open settings"));
    assert!(requests[0][1].text().contains(r#""current_app":"com.android.settings""#));
    for req in &requests[1..] {
        assert!(req.last().unwrap().text().starts_with(SCREEN_INFO_MARKER));
    }
    // only the newest screenshot is ever sent
    for req in &requests {
        assert_eq!(req.iter().map(ChatMessage::image_count).sum::<usize>(), 1);
        assert!(req.last().unwrap().has_image());
    }
    // assistant turns are stored in think/answer form
    assert_eq!(
        requests[1][2].text(),
        r#"<think>Go back.</think><answer>do(action="Back")</answer>"#
    );
    assert_eq!(phone.calls(), vec!["back", "back"]);
}

#[tokio::test]
async fn undecodable_reply_asks_for_correction() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&["I am not sure what to do here.", FINISH]));

    let report = run(&phone, &gateway).await;

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(report.state.step_index, 0);
    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1]
        .iter()
        .any(|m| m.role == Role::User && m.text() == FORMAT_CORRECTION));
    // the task is not repeated after a correction
    assert!(requests[1].last().unwrap().text().starts_with(SCREEN_INFO_MARKER));
}

#[tokio::test]
async fn repeated_format_failures_fail_the_run() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::always("no idea"));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("decode"));
    assert_eq!(gateway.requests().len(), 6);
    assert!(phone.calls().is_empty());
}

#[tokio::test]
async fn transport_errors_are_retried() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::replying([
        Err(PilotError::Transport("503".into())),
        Err(PilotError::Transport("503".into())),
        Ok(FINISH.to_string()),
    ]));

    let report = run(&phone, &gateway).await;

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(gateway.requests().len(), 3);
    // history only grows once the call succeeds
    assert_eq!(report.context.len(), 3);
}

#[tokio::test]
async fn exhausted_transport_retries_fail_the_run() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::replying([
        Err(PilotError::Transport("timeout".into())),
        Err(PilotError::Transport("timeout".into())),
        Err(PilotError::Transport("timeout".into())),
        Ok(FINISH.to_string()),
    ]));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("timeout"));
    assert_eq!(gateway.requests().len(), 3);
    assert_eq!(phone.foreground_calls(), 1);
}

#[tokio::test]
async fn non_transport_errors_are_not_retried() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::replying([Err(PilotError::Config("bad key".into()))]));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("bad key"));
    assert_eq!(gateway.requests().len(), 1);
}

#[tokio::test]
async fn cancel_interrupts_a_model_call() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::hanging());
    let control = RunControl::new();
    let engine = AgentEngine::new(settings(), parts(&phone, &gateway), control.clone(), EventBus::new());

    let handle = tokio::spawn(async move { engine.run("open settings").await });
    gateway.started.notified().await;
    control.cancel();
    let report = handle.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.state.status, RunStatus::Cancelled);
    assert_eq!(phone.foreground_calls(), 0);
    assert!(phone.calls().is_empty());
}

#[tokio::test]
async fn pause_holds_the_loop_at_a_step_boundary() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&[FINISH]));
    let control = RunControl::new();
    control.pause();
    let engine = AgentEngine::new(settings(), parts(&phone, &gateway), control.clone(), EventBus::new());
    let mut state = engine.state_watch();

    let handle = tokio::spawn(async move { engine.run("open settings").await });
    state.wait_for(|s| s.status == RunStatus::Paused).await.unwrap();
    assert_eq!(phone.screenshots(), 0);
    assert!(gateway.requests().is_empty());

    control.resume();
    let report = handle.await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { message: "done".into() });
    assert_eq!(phone.screenshots(), 1);
}

#[tokio::test]
async fn no_screenshot_capability_is_fatal() {
    let phone = Arc::new(FakePhone::with_frame(None));
    let gateway = Arc::new(ScriptedGateway::always(FINISH));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("Environment"));
    assert!(gateway.requests().is_empty());
}

#[tokio::test]
async fn blank_screen_fails_on_a_real_device() {
    let phone = Arc::new(FakePhone::black());
    let gateway = Arc::new(ScriptedGateway::always(FINISH));

    let report = run(&phone, &gateway).await;

    assert!(failed_reason(&report).contains("blank"));
    assert!(gateway.requests().is_empty());
    assert_eq!(phone.foreground_calls(), 1);
}

#[tokio::test]
async fn blank_screen_is_accepted_on_an_emulator() {
    let mut phone = FakePhone::black();
    phone.emulator = true;
    let phone = Arc::new(phone);
    let gateway = Arc::new(ScriptedGateway::texts(&[FINISH]));

    let report = run(&phone, &gateway).await;

    assert_eq!(report.outcome, RunOutcome::Completed { message: "done".into() });
    assert_eq!(gateway.requests().len(), 1);
}

#[tokio::test]
async fn host_app_is_never_sent_to_the_model() {
    let phone = Arc::new(FakePhone::new());
    phone
        .apps
        .lock()
        .unwrap()
        .extend([HOST_APP, HOST_APP, HOST_APP].map(String::from));
    let gateway = Arc::new(ScriptedGateway::texts(&[BACK, FINISH]));
    let mut settings = settings();
    settings.agent.host_app = Some(HOST_APP.to_string());

    let report = run_with(settings, &phone, &gateway, EventBus::new()).await;

    assert_eq!(report.outcome, RunOutcome::Completed { message: "done".into() });
    // step 0 goes out as text only; step 1 waits twice for the host app to leave
    assert_eq!(phone.screenshots(), 1);
    assert_eq!(report.state.step_index, 1);
    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    let first = requests[0].last().unwrap();
    assert!(!first.has_image());
    assert!(first.text().starts_with("open settings"));
    let second = requests[1].last().unwrap();
    assert!(second.has_image());
    assert!(second.text().contains(TARGET_APP));
}

#[tokio::test]
async fn prompt_log_records_step_timing() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&[BACK, FINISH]));

    let report = run(&phone, &gateway).await;
    let log = report.context.render_log();

    assert!(log.starts_with("[SYSTEM]:"));
    assert!(log.contains("[TIMING & IMAGE INFO - Step 0]:"));
    assert!(log.contains("- Image: 100x200, size:"));
    assert!(log.contains("[IMAGE CONTENT]"));
    assert_eq!(report.context.step_records().count(), 1);
}

#[tokio::test]
async fn supervisor_restart_cancels_the_previous_run() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::hanging());
    let supervisor = AgentSupervisor::new(settings(), parts(&phone, &gateway));
    let mut events = supervisor.subscribe();

    supervisor.start("first task").await;
    gateway.started.notified().await;
    supervisor.start("second task").await;

    let finished: Vec<RunOutcome> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::Finished { outcome } => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![RunOutcome::Cancelled]);
    let state = supervisor.status().await.unwrap();
    assert!(!state.is_terminal());
    assert_eq!(state.step_index, 0);

    gateway.started.notified().await;
    assert!(supervisor.stop().await);
    let report = supervisor.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0][1].text().starts_with("first task"));
    assert!(requests[1][1].text().starts_with("second task"));
}

#[tokio::test]
async fn supervisor_without_a_run_ignores_controls() {
    let phone = Arc::new(FakePhone::new());
    let gateway = Arc::new(ScriptedGateway::texts(&[FINISH]));
    let supervisor = AgentSupervisor::new(settings(), parts(&phone, &gateway));

    assert!(!supervisor.pause().await);
    assert!(!supervisor.stop().await);
    assert!(supervisor.toggle_pause().await.is_none());
    assert!(supervisor.status().await.is_none());
    assert!(supervisor.wait().await.is_none());

    supervisor.start("open settings").await;
    let report = supervisor.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { message: "done".into() });
    assert_eq!(supervisor.status().await.unwrap().status, RunStatus::Completed);
}
