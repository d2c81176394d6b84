pub mod action;
pub mod agent_engine;
pub mod config;
pub mod device;
pub mod errors;
pub mod llm;
pub mod perception;

pub use agent_engine::engine::{AgentEngine, EngineParts, EngineSettings, RunReport};
pub use agent_engine::supervisor::AgentSupervisor;
pub use errors::{PilotError, PilotResult};

/// Install the global subscriber (`RUST_LOG`, default `info`) and load `.env`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // .env is optional
    let _ = dotenvy::dotenv();
}
