use std::sync::Arc;
use std::time::Duration;

use crate::action::types::{Action, DeviceAction};
use crate::device::apps::AppRegistry;
use crate::device::traits::{Actuation, DeviceActuator};

/// Gap between the two taps of a double tap.
const DOUBLE_TAP_GAP: Duration = Duration::from_millis(100);

/// Runs device-space actions against a [`DeviceActuator`].
pub struct ActionExecutor {
    actuator: Arc<dyn DeviceActuator>,
    apps: AppRegistry,
}

impl ActionExecutor {
    pub fn new(actuator: Arc<dyn DeviceActuator>, apps: AppRegistry) -> Self {
        Self { actuator, apps }
    }

    pub fn actuator(&self) -> &Arc<dyn DeviceActuator> {
        &self.actuator
    }

    /// Registry table, then the device's installed apps, then the name as given.
    pub async fn resolve_app(&self, name: &str) -> String {
        if let Some(pkg) = self.apps.lookup(name) {
            return pkg.to_string();
        }
        if let Some(pkg) = self.actuator.resolve_installed(name).await {
            tracing::debug!(app = %name, package = %pkg, "app resolved from installed packages");
            return pkg;
        }
        name.trim().to_string()
    }

    /// `Wait` is a no-op here: the agent loop sleeps so the wait stays
    /// cancellable. `Finish` is never actuated.
    pub async fn execute(&self, action: &DeviceAction) -> Actuation {
        tracing::info!(action = action.name(), "executing action");
        let result = match action {
            Action::Launch { app } => {
                let package = self.resolve_app(app).await;
                let result = self.actuator.launch(&package).await;
                if result.success {
                    result
                } else {
                    Actuation::failed(format!("cannot launch {app}: {}", result.describe()))
                }
            }
            Action::Tap { point, sensitive } => {
                if *sensitive {
                    tracing::warn!(%point, "sensitive tap");
                }
                self.actuator.tap(*point).await
            }
            Action::TapLabel { label } => match self.actuator.find_by_label(label).await {
                Some(point) => self.actuator.tap(point).await,
                None => Actuation::failed(format!("no element labelled \"{label}\"")),
            },
            Action::Type { text } => self.actuator.set_text(text).await,
            Action::Swipe { from, to } => self.actuator.swipe(*from, *to).await,
            Action::LongPress { point } => self.actuator.long_press(*point).await,
            Action::DoubleTap { point } => {
                let first = self.actuator.tap(*point).await;
                if !first.success {
                    return first;
                }
                tokio::time::sleep(DOUBLE_TAP_GAP).await;
                self.actuator.tap(*point).await
            }
            Action::Wait { .. } => Actuation::ok(),
            Action::Back => self.actuator.back().await,
            Action::Home => self.actuator.home().await,
            Action::Finish { .. } => Actuation::failed("finish is handled by the agent loop"),
        };

        if !result.success {
            tracing::warn!(action = action.name(), reason = %result.describe(), "action failed");
        }
        result
    }
}
