//! Simulated drivers used by the CLI.
//!
//! `sim.device` equipment accepts any command and answers after
//! `options.delay_ms`; `sim.arm` equipment moves labware between the names in
//! `options.positions`. Nothing here talks to hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use labflow_config::EquipmentDefinition;
use labflow_engine::{DriverFactory, EngineError};
use labflow_types::{
    DeviceError, DeviceHandle, DeviceResult, Driver, LabwareHandoff, LabwarePlaceable,
    TemperatureControl, Transporter,
};
use parking_lot::Mutex;

const AMBIENT_CELSIUS: f64 = 22.0;

/// A bench device with a nest and a heater.
pub struct SimDevice {
    name: String,
    delay: Duration,
    initialized: AtomicBool,
    connected: AtomicBool,
    running: AtomicBool,
    temperature: Mutex<f64>,
    staged: Mutex<Option<String>>,
}

impl SimDevice {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            initialized: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            temperature: Mutex::new(AMBIENT_CELSIUS),
            staged: Mutex::new(None),
        }
    }

    fn stage(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        let mut staged = self.staged.lock();
        if let Some(current) = staged.as_ref() {
            return Err(DeviceError::busy(
                &self.name,
                format!("already staged for {current}"),
            ));
        }
        *staged = Some(handoff.labware_name.clone());
        Ok(())
    }

    fn unstage(&self) {
        self.staged.lock().take();
    }
}

#[async_trait]
impl Driver for SimDevice {
    async fn initialize(&self) -> DeviceResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self) -> DeviceResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        options: &serde_json::Value,
    ) -> DeviceResult<serde_json::Value> {
        if !self.is_initialized() {
            return Err(DeviceError::not_initialized(&self.name));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::busy(&self.name, "a command is already running"));
        }
        tracing::debug!(device = %self.name, command = %command, "sim execute");
        tokio::time::sleep(self.delay).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(serde_json::json!({
            "device": self.name,
            "command": command,
            "options": options,
        }))
    }
}

#[async_trait]
impl LabwarePlaceable for SimDevice {
    async fn prepare_for_pick(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.stage(handoff)
    }

    async fn prepare_for_place(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.stage(handoff)
    }

    async fn notify_picked(&self, _handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.unstage();
        Ok(())
    }

    async fn notify_placed(&self, _handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.unstage();
        Ok(())
    }
}

#[async_trait]
impl TemperatureControl for SimDevice {
    async fn set_temperature(&self, celsius: f64) -> DeviceResult<()> {
        tokio::time::sleep(self.delay).await;
        *self.temperature.lock() = celsius;
        Ok(())
    }

    async fn temperature(&self) -> DeviceResult<f64> {
        Ok(*self.temperature.lock())
    }
}

/// A robotic arm that holds one labware at a time.
pub struct SimArm {
    name: String,
    positions: Vec<String>,
    delay: Duration,
    initialized: AtomicBool,
    holding: Mutex<Option<String>>,
}

impl SimArm {
    pub fn new(name: impl Into<String>, positions: Vec<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            positions,
            delay,
            initialized: AtomicBool::new(false),
            holding: Mutex::new(None),
        }
    }

    fn check_position(&self, position: &str) -> DeviceResult<()> {
        if self.positions.iter().any(|p| p == position) {
            Ok(())
        } else {
            Err(DeviceError::failed(
                &self.name,
                format!("position {position} is not taught"),
            ))
        }
    }
}

#[async_trait]
impl Driver for SimArm {
    async fn initialize(&self) -> DeviceResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        _options: &serde_json::Value,
    ) -> DeviceResult<serde_json::Value> {
        Err(DeviceError::failed(
            &self.name,
            format!("arm does not run '{command}'"),
        ))
    }
}

#[async_trait]
impl Transporter for SimArm {
    async fn pick(&self, position_name: &str, labware_type: &str) -> DeviceResult<()> {
        self.check_position(position_name)?;
        if let Some(held) = self.holding.lock().as_ref() {
            return Err(DeviceError::busy(&self.name, format!("already holding {held}")));
        }
        tokio::time::sleep(self.delay).await;
        *self.holding.lock() = Some(labware_type.to_string());
        tracing::debug!(arm = %self.name, position = %position_name, "sim pick");
        Ok(())
    }

    async fn place(&self, position_name: &str, _labware_type: &str) -> DeviceResult<()> {
        self.check_position(position_name)?;
        if self.holding.lock().is_none() {
            return Err(DeviceError::failed(&self.name, "nothing to place"));
        }
        tokio::time::sleep(self.delay).await;
        self.holding.lock().take();
        tracing::debug!(arm = %self.name, position = %position_name, "sim place");
        Ok(())
    }

    async fn get_taught_positions(&self) -> DeviceResult<Vec<String>> {
        Ok(self.positions.clone())
    }
}

/// Builds simulated drivers from catalog equipment.
#[derive(Debug, Default)]
pub struct SimDriverFactory;

impl SimDriverFactory {
    pub fn new() -> Self {
        Self
    }
}

impl DriverFactory for SimDriverFactory {
    fn build(&self, definition: &EquipmentDefinition) -> labflow_engine::Result<DeviceHandle> {
        let delay = definition
            .options
            .get("delay_ms")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or_default();
        match definition.driver.as_str() {
            "sim.arm" => {
                let positions: Vec<String> = definition
                    .options
                    .get("positions")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| {
                        EngineError::Config(format!(
                            "'{}': positions must be a list of names: {e}",
                            definition.name
                        ))
                    })?
                    .unwrap_or_default();
                let arm = Arc::new(SimArm::new(&definition.name, positions, delay));
                Ok(DeviceHandle::new(arm.clone()).with_transporter(arm))
            }
            "sim.device" => {
                let device = Arc::new(SimDevice::new(&definition.name, delay));
                Ok(DeviceHandle::new(device.clone())
                    .with_placeable(device.clone())
                    .with_temperature(device))
            }
            other => Err(EngineError::Config(format!(
                "unknown driver kind '{other}' for '{}'",
                definition.name
            ))),
        }
    }
}
