use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use phonepilot::agent_engine::event_bus::AgentEvent;
use phonepilot::agent_engine::state::RunOutcome;
use phonepilot::config::load_config;
use phonepilot::device::adb::AdbDevice;
use phonepilot::device::apps::AppRegistry;
use phonepilot::llm::providers::openai_compatible::OpenAiCompatibleGateway;
use phonepilot::{AgentSupervisor, EngineParts, EngineSettings, PilotError, PilotResult};

#[derive(Parser, Debug)]
#[command(
    name = "phonepilot",
    version,
    about = "Carry out a task on an Android phone with a vision-language model"
)]
struct Cli {
    /// Path to config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// adb serial of the target device
    #[arg(short, long)]
    serial: Option<String>,

    /// Print the full prompt log when the run ends
    #[arg(long)]
    prompt_log: bool,

    /// What to do, in natural language
    #[arg(required = true, num_args = 1..)]
    task: Vec<String>,
}

#[tokio::main]
async fn main() {
    phonepilot::init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(RunOutcome::Completed { .. }) => 0,
        Ok(_) => 1,
        Err(e) => {
            tracing::error!(error = %e, "phonepilot failed");
            eprintln!("error: {e}");
            2
        }
    };
    // stdin may still be blocked on a read.
    std::process::exit(code);
}

async fn run(cli: Cli) -> PilotResult<RunOutcome> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(serial) = cli.serial {
        config.device.serial = Some(serial);
    }

    let apps = match &config.apps.mapping_file {
        Some(path) => AppRegistry::with_overrides(path)?,
        None => AppRegistry::builtin(),
    };
    let device = Arc::new(AdbDevice::new(&config.device, config.agent.host_app.clone()));
    let gateway = Arc::new(OpenAiCompatibleGateway::new(&config.llm)?);
    let parts = EngineParts {
        observer: device.clone(),
        actuator: device,
        gateway,
        apps,
    };
    let supervisor = Arc::new(AgentSupervisor::new(EngineSettings::from(&config), parts));

    let mut events = supervisor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let task = cli.task.join(" ");
    println!("task: {task}");
    println!("type pause, resume or stop and press enter to control the run");
    supervisor.start(task).await;
    let controls = tokio::spawn(read_controls(supervisor.clone()));

    let report = tokio::select! {
        report = supervisor.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, stopping");
            supervisor.stop().await;
            supervisor.wait().await
        }
    };
    controls.abort();
    printer.abort();

    let report = report.ok_or_else(|| PilotError::Agent("run ended without a report".into()))?;
    if cli.prompt_log {
        println!("{}", report.context.render_log());
    }
    match &report.outcome {
        RunOutcome::Completed { message } => println!("completed: {message}"),
        RunOutcome::Failed { reason } => println!("failed: {reason}"),
        RunOutcome::Cancelled => println!("cancelled"),
    }
    println!("steps: {}  session: {}", report.state.step_index, report.session_id);
    Ok(report.outcome.clone())
}

async fn read_controls(supervisor: Arc<AgentSupervisor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "pause" | "p" => {
                supervisor.pause().await;
                println!("pausing after the current step");
            }
            "resume" | "r" => {
                supervisor.resume().await;
                println!("resumed");
            }
            "stop" | "s" => {
                supervisor.stop().await;
                println!("stopping");
            }
            "" => {}
            other => eprintln!("unknown command {other:?}; use pause, resume or stop"),
        }
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::StatusChanged { status, .. } => println!("[status] {status:?}"),
        AgentEvent::StepStarted { step, current_app } => println!(
            "[step {step}] foreground: {}",
            current_app.as_deref().unwrap_or("unknown")
        ),
        AgentEvent::ModelReply {
            step,
            thinking,
            action_text,
        } => {
            if !thinking.is_empty() {
                println!("[step {step}] thinking: {thinking}");
            }
            println!("[step {step}] action: {action_text}");
        }
        AgentEvent::ActionExecuted {
            step,
            action,
            success,
            message,
        } => {
            let detail = message.as_deref().unwrap_or("");
            if *success {
                println!("[step {step}] {action} ok {detail}");
            } else {
                println!("[step {step}] {action} failed {detail}");
            }
        }
        AgentEvent::Notice { message } => println!("[notice] {message}"),
        AgentEvent::Finished { .. } => {}
    }
}
