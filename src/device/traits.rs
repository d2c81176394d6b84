use async_trait::async_trait;
use serde::Serialize;

use crate::action::types::DevicePoint;
use crate::perception::frame::ScreenFrame;

/// Outcome of one device primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actuation {
    pub success: bool,
    pub message: Option<String>,
}

impl Actuation {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    /// Message for logs and failure reasons.
    pub fn describe(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or(if self.success { "ok" } else { "action failed" })
    }
}

/// Read-only view of the device. Safe to call from any task.
#[async_trait]
pub trait Observer: Send + Sync {
    /// `None` when the capture capability is unavailable.
    async fn screenshot(&self) -> Option<ScreenFrame>;

    /// Package or identifier of the foreground app, when known.
    async fn current_app(&self) -> Option<String>;

    /// Emulators legitimately return black frames.
    async fn is_emulator(&self) -> bool {
        false
    }
}

/// Gesture and input primitives, in device pixels.
#[async_trait]
pub trait DeviceActuator: Send + Sync {
    async fn tap(&self, point: DevicePoint) -> Actuation;
    async fn long_press(&self, point: DevicePoint) -> Actuation;
    async fn swipe(&self, from: DevicePoint, to: DevicePoint) -> Actuation;
    /// Replace the content of the focused input field.
    async fn set_text(&self, text: &str) -> Actuation;
    async fn back(&self) -> Actuation;
    async fn home(&self) -> Actuation;
    async fn launch(&self, app_id: &str) -> Actuation;
    /// Center of the first node whose visible text or description matches.
    async fn find_by_label(&self, label: &str) -> Option<DevicePoint>;
    /// Return the host app to the foreground at the end of a run.
    async fn bring_to_foreground(&self);

    /// Installed-app lookup for names the static registry does not know.
    async fn resolve_installed(&self, _app_name: &str) -> Option<String> {
        None
    }
}
