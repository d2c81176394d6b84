use serde::{Deserialize, Serialize};

use crate::action::types::{Action, DeviceAction, DevicePoint, ModelAction, ModelPoint};
use crate::errors::{PilotError, PilotResult};

/// Scale of the model's normalized grid. Axis values live in `[0, 999]`.
const MODEL_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

impl ImageDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Converts model-space points into pixels of the image the model saw.
///
/// Must be built from the dimensions of the image actually sent (after any
/// scaling), not the physical display resolution.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateMapper {
    width: f64,
    height: f64,
}

impl CoordinateMapper {
    pub fn new(dims: ImageDims) -> PilotResult<Self> {
        if dims.width == 0 || dims.height == 0 {
            return Err(PilotError::Image(format!(
                "cannot map coordinates onto a {}x{} image",
                dims.width, dims.height
            )));
        }
        Ok(Self {
            width: dims.width as f64,
            height: dims.height as f64,
        })
    }

    pub fn to_device(&self, p: ModelPoint) -> DevicePoint {
        DevicePoint::new(p.x() / MODEL_SCALE * self.width, p.y() / MODEL_SCALE * self.height)
    }

    /// Inverse of [`Self::to_device`].
    pub fn to_model(&self, p: DevicePoint) -> ModelPoint {
        ModelPoint::new(p.x / self.width * MODEL_SCALE, p.y / self.height * MODEL_SCALE)
    }

    pub fn map_action(&self, action: ModelAction) -> DeviceAction {
        let mapped = action.map_points(|p| self.to_device(p));
        if let Action::Tap { point, .. } = &mapped {
            tracing::debug!(x = point.x, y = point.y, "tap mapped to device pixels");
        }
        mapped
    }
}
