//! Device driver capability interfaces.
//!
//! Drivers are external collaborators. A device declares the subset of
//! capabilities it implements by filling a [`DeviceHandle`]; the engine
//! dispatches by capability, never by concrete type. All operations may
//! suspend and may fail with a [`DeviceError`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::labware::Labware;

/// Result type for driver operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by device drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Generic device failure.
    #[error("device '{device}' failed: {message}")]
    Failed { device: String, message: String },

    /// The device is busy or already staged for another labware.
    #[error("device '{device}' is busy: {message}")]
    Busy { device: String, message: String },

    /// The device was used before `initialize()` succeeded.
    #[error("device '{device}' is not initialized")]
    NotInitialized { device: String },
}

impl DeviceError {
    /// Create a generic failure.
    pub fn failed(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a busy error.
    pub fn busy(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Busy {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a not-initialized error.
    pub fn not_initialized(device: impl Into<String>) -> Self {
        Self::NotInitialized {
            device: device.into(),
        }
    }

    /// Name of the device that raised the error.
    pub fn device(&self) -> &str {
        match self {
            DeviceError::Failed { device, .. }
            | DeviceError::Busy { device, .. }
            | DeviceError::NotInitialized { device } => device,
        }
    }
}

/// Labware details handed to a device before and after a pick or place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabwareHandoff {
    pub labware_name: String,
    pub labware_type: String,
    pub barcode: Option<String>,
    pub alias: Option<String>,
}

impl LabwareHandoff {
    /// Describe a labware item for a handoff at the given location alias.
    pub fn new(labware: &Labware, alias: Option<&str>) -> Self {
        Self {
            labware_name: labware.name.clone(),
            labware_type: labware.labware_type.clone(),
            barcode: labware.barcode.clone(),
            alias: alias.map(str::to_string),
        }
    }
}

/// Base capability every device implements.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Bring the device to a ready state.
    async fn initialize(&self) -> DeviceResult<()>;

    /// Open the connection to the device.
    async fn connect(&self) -> DeviceResult<()>;

    /// Close the connection to the device.
    async fn disconnect(&self) -> DeviceResult<()>;

    fn is_initialized(&self) -> bool;

    fn is_running(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Run a device command.
    async fn execute(
        &self,
        command: &str,
        options: &serde_json::Value,
    ) -> DeviceResult<serde_json::Value>;
}

/// Devices with a nest that labware can be placed onto or picked from.
#[async_trait]
pub trait LabwarePlaceable: Send + Sync {
    async fn prepare_for_pick(&self, handoff: &LabwareHandoff) -> DeviceResult<()>;

    async fn prepare_for_place(&self, handoff: &LabwareHandoff) -> DeviceResult<()>;

    async fn notify_picked(&self, handoff: &LabwareHandoff) -> DeviceResult<()>;

    async fn notify_placed(&self, handoff: &LabwareHandoff) -> DeviceResult<()>;
}

/// Robotic arms and other devices that move labware between positions.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Pick labware of the given type from a taught position.
    async fn pick(&self, position_name: &str, labware_type: &str) -> DeviceResult<()>;

    /// Place the held labware at a taught position.
    async fn place(&self, position_name: &str, labware_type: &str) -> DeviceResult<()>;

    /// Names of the positions this transporter can reach.
    async fn get_taught_positions(&self) -> DeviceResult<Vec<String>>;
}

/// Heaters, coolers and incubators.
#[async_trait]
pub trait TemperatureControl: Send + Sync {
    async fn set_temperature(&self, celsius: f64) -> DeviceResult<()>;

    async fn temperature(&self) -> DeviceResult<f64>;
}

/// A named transporter position with joint coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teachpoint {
    pub name: String,
    pub joints: Vec<f64>,
}

/// Source of teachpoints for a transporter (e.g. a teachpoint file parser).
pub trait TeachpointSource: Send + Sync {
    fn teachpoints(&self) -> DeviceResult<Vec<Teachpoint>>;
}

/// The capability subset one physical device exposes.
#[derive(Clone)]
pub struct DeviceHandle {
    pub driver: Arc<dyn Driver>,
    pub placeable: Option<Arc<dyn LabwarePlaceable>>,
    pub transporter: Option<Arc<dyn Transporter>>,
    pub temperature: Option<Arc<dyn TemperatureControl>>,
    pub teachpoints: Option<Arc<dyn TeachpointSource>>,
}

impl DeviceHandle {
    /// A device exposing only the base driver capability.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            placeable: None,
            transporter: None,
            temperature: None,
            teachpoints: None,
        }
    }

    pub fn with_placeable(mut self, placeable: Arc<dyn LabwarePlaceable>) -> Self {
        self.placeable = Some(placeable);
        self
    }

    pub fn with_transporter(mut self, transporter: Arc<dyn Transporter>) -> Self {
        self.transporter = Some(transporter);
        self
    }

    pub fn with_temperature(mut self, temperature: Arc<dyn TemperatureControl>) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_teachpoints(mut self, source: Arc<dyn TeachpointSource>) -> Self {
        self.teachpoints = Some(source);
        self
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("placeable", &self.placeable.is_some())
            .field("transporter", &self.transporter.is_some())
            .field("temperature", &self.temperature.is_some())
            .field("teachpoints", &self.teachpoints.is_some())
            .finish()
    }
}
