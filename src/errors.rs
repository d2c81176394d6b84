use thiserror::Error;

use crate::action::decoder::DecodeError;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model transport error: {0}")]
    Transport(String),

    #[error("Action decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Actuation failed: {0}")]
    Actuation(String),

    /// Missing capture/accessibility capability or an unusable screen.
    /// Never retried.
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Task cancelled")]
    Cancelled,
}

impl PilotError {
    /// Errors produced while talking to the model endpoint.
    pub fn is_transport(&self) -> bool {
        matches!(self, PilotError::Transport(_) | PilotError::Http(_))
    }
}

impl serde::Serialize for PilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type PilotResult<T> = Result<T, PilotError>;
