use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest coordinate on either axis of the model's normalized grid.
pub const MODEL_SPACE_MAX: f64 = 999.0;

/// A point on the 0–999 grid the vision model reports in (origin top-left).
///
/// Construction clamps into range: the model is expected to be slightly off
/// now and then, and an out-of-range point is still the best guess we have.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPoint {
    x: f64,
    y: f64,
}

impl ModelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: clamp_axis(x),
            y: clamp_axis(y),
        }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }
}

fn clamp_axis(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, MODEL_SPACE_MAX)
}

/// A point in raw pixels of the frame the model was shown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePoint {
    pub x: f64,
    pub y: f64,
}

impl DevicePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Integer pixel position, for backends that only take whole pixels.
    pub fn rounded(&self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

impl fmt::Display for ModelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

impl fmt::Display for DevicePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1},{:.1})", self.x, self.y)
    }
}

/// One decoded instruction from the model.
///
/// Generic over the coordinate space: the decoder produces
/// `Action<ModelPoint>`, and only [`crate::action::coords::CoordinateMapper`]
/// turns that into an `Action<DevicePoint>` the executor accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action<P> {
    Launch { app: String },
    Tap { point: P, sensitive: bool },
    /// Tap on the node whose visible label matches `label`.
    TapLabel { label: String },
    Type { text: String },
    Swipe { from: P, to: P },
    LongPress { point: P },
    DoubleTap { point: P },
    Wait { duration: Duration },
    Back,
    Home,
    Finish { message: String },
}

pub type ModelAction = Action<ModelPoint>;
pub type DeviceAction = Action<DevicePoint>;

impl<P> Action<P> {
    /// Rebuild the action with every point passed through `f`.
    pub fn map_points<Q>(self, mut f: impl FnMut(P) -> Q) -> Action<Q> {
        match self {
            Action::Launch { app } => Action::Launch { app },
            Action::Tap { point, sensitive } => Action::Tap {
                point: f(point),
                sensitive,
            },
            Action::TapLabel { label } => Action::TapLabel { label },
            Action::Type { text } => Action::Type { text },
            Action::Swipe { from, to } => {
                let from = f(from);
                let to = f(to);
                Action::Swipe { from, to }
            }
            Action::LongPress { point } => Action::LongPress { point: f(point) },
            Action::DoubleTap { point } => Action::DoubleTap { point: f(point) },
            Action::Wait { duration } => Action::Wait { duration },
            Action::Back => Action::Back,
            Action::Home => Action::Home,
            Action::Finish { message } => Action::Finish { message },
        }
    }

    /// Whether executing this action needs screen coordinates.
    pub fn needs_coordinates(&self) -> bool {
        matches!(
            self,
            Action::Tap { .. } | Action::Swipe { .. } | Action::LongPress { .. } | Action::DoubleTap { .. }
        )
    }

    /// Short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Launch { .. } => "Launch",
            Action::Tap { .. } => "Tap",
            Action::TapLabel { .. } => "Tap",
            Action::Type { .. } => "Type",
            Action::Swipe { .. } => "Swipe",
            Action::LongPress { .. } => "Long Press",
            Action::DoubleTap { .. } => "Double Tap",
            Action::Wait { .. } => "Wait",
            Action::Back => "Back",
            Action::Home => "Home",
            Action::Finish { .. } => "Finish",
        }
    }
}
