//! Pathfinder hardware capability boundary.
//!
//! The concrete driver (motors, ultrasonic ranger, camera) lives outside
//! this repository; the agent only ever sees an opaque `Arc<dyn Hardware>`.
//! Responsibilities:
//! - defining the operation set a running script may invoke
//! - defining the error surface those operations report through
//! - providing the hardware-disabled handle used when no driver is wired

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("hardware is disabled on this agent")]
    Disabled,
    #[error("motor command failed: {0}")]
    Motor(String),
    #[error("range measurement failed: {0}")]
    Ranging(String),
    #[error("camera capture failed: {0}")]
    Camera(String),
}

/// One robot, one handle. Implementations must serialize access
/// internally: the agent clones the same `Arc<dyn Hardware>` into every
/// running session and does not arbitrate between them, so concurrent
/// calls are last-writer-wins at the driver.
pub trait Hardware: Send + Sync {
    /// Set wheel speeds in percent, negative for reverse. Implementations
    /// clamp to their safe range.
    fn drive(&self, left: f32, right: f32) -> Result<(), HardwareError>;

    /// Cut motor output immediately.
    fn stop(&self) -> Result<(), HardwareError>;

    /// Ultrasonic range to the nearest obstacle, in centimeters.
    fn distance(&self) -> Result<f32, HardwareError>;

    /// Grab one camera frame, JPEG-encoded.
    fn capture_jpeg(&self) -> Result<Vec<u8>, HardwareError>;
}

/// Stand-in handle for agents provisioned without a driver. Every call
/// fails with [`HardwareError::Disabled`]; scripts see the error, the
/// agent keeps running.
#[derive(Debug, Default)]
pub struct DisabledHardware;

impl DisabledHardware {
    pub fn shared() -> Arc<dyn Hardware> {
        Arc::new(Self)
    }
}

impl Hardware for DisabledHardware {
    fn drive(&self, _left: f32, _right: f32) -> Result<(), HardwareError> {
        Err(HardwareError::Disabled)
    }

    fn stop(&self) -> Result<(), HardwareError> {
        Err(HardwareError::Disabled)
    }

    fn distance(&self) -> Result<f32, HardwareError> {
        Err(HardwareError::Disabled)
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>, HardwareError> {
        Err(HardwareError::Disabled)
    }
}
