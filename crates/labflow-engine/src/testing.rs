//! In-memory drivers for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use labflow_types::{
    DeviceError, DeviceHandle, DeviceResult, Driver, LabwareHandoff, LabwarePlaceable,
    TemperatureControl, Transporter,
};
use parking_lot::Mutex;

use crate::lab::DriverFactory;

/// A placeable, temperature-controlled device that records every call.
pub struct MockDevice {
    name: String,
    initialized: AtomicBool,
    connected: AtomicBool,
    running: AtomicBool,
    fail_on: Option<String>,
    panic_on: Option<String>,
    delay: Duration,
    temperature: Mutex<f64>,
    calls: Mutex<Vec<String>>,
}

impl MockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialized: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            fail_on: None,
            panic_on: None,
            delay: Duration::ZERO,
            temperature: Mutex::new(20.0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every `execute` of `command`.
    pub fn failing_on(mut self, command: impl Into<String>) -> Self {
        self.fail_on = Some(command.into());
        self
    }

    /// Panic inside every `execute` of `command`, like a driver bug would.
    pub fn panicking_on(mut self, command: impl Into<String>) -> Self {
        self.panic_on = Some(command.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Start out initialized, as if `initialize` already ran.
    pub fn initialized(self) -> Self {
        self.initialized.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn current_temperature(&self) -> f64 {
        *self.temperature.lock()
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        DeviceHandle::new(self.clone())
            .with_placeable(self.clone())
            .with_temperature(self.clone())
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn record_handoff(&self, op: &str, handoff: &LabwareHandoff) {
        self.record(format!(
            "{op}:{}:{}",
            handoff.labware_name,
            handoff.alias.as_deref().unwrap_or("-")
        ));
    }
}

#[async_trait]
impl Driver for MockDevice {
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
        self.record(format!("execute:{command}"));
        if !self.is_initialized() {
            return Err(DeviceError::not_initialized(&self.name));
        }
        if self.fail_on.as_deref() == Some(command) {
            return Err(DeviceError::failed(&self.name, format!("{command} failed")));
        }
        if self.panic_on.as_deref() == Some(command) {
            panic!("device '{}' crashed running {command}", self.name);
        }
        self.running.store(true, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(serde_json::json!({ "command": command, "options": options }))
    }
}

#[async_trait]
impl LabwarePlaceable for MockDevice {
    async fn prepare_for_pick(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.record_handoff("prepare_for_pick", handoff);
        Ok(())
    }

    async fn prepare_for_place(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.record_handoff("prepare_for_place", handoff);
        Ok(())
    }

    async fn notify_picked(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.record_handoff("notify_picked", handoff);
        Ok(())
    }

    async fn notify_placed(&self, handoff: &LabwareHandoff) -> DeviceResult<()> {
        self.record_handoff("notify_placed", handoff);
        Ok(())
    }
}

#[async_trait]
impl TemperatureControl for MockDevice {
    async fn set_temperature(&self, celsius: f64) -> DeviceResult<()> {
        self.record(format!("set_temperature:{celsius}"));
        *self.temperature.lock() = celsius;
        Ok(())
    }

    async fn temperature(&self) -> DeviceResult<f64> {
        Ok(self.current_temperature())
    }
}

/// A transporter that tracks how many motions overlap.
pub struct MockTransporter {
    name: String,
    positions: Vec<String>,
    initialized: AtomicBool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl MockTransporter {
    pub fn new(name: impl Into<String>, positions: &[&str]) -> Self {
        Self {
            name: name.into(),
            positions: positions.iter().map(|p| p.to_string()).collect(),
            initialized: AtomicBool::new(false),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of pick/place calls ever in flight at once.
    pub fn max_concurrent_motion(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        DeviceHandle::new(self.clone()).with_transporter(self.clone())
    }

    async fn motion(&self, op: &str, position: &str, labware_type: &str) -> DeviceResult<()> {
        if !self.positions.iter().any(|p| p == position) {
            return Err(DeviceError::failed(
                &self.name,
                format!("unknown position {position}"),
            ));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .push(format!("{op}:{position}:{labware_type}"));
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Driver for MockTransporter {
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
        self.in_flight.load(Ordering::SeqCst) > 0
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
            format!("unsupported command {command}"),
        ))
    }
}

#[async_trait]
impl Transporter for MockTransporter {
    async fn pick(&self, position_name: &str, labware_type: &str) -> DeviceResult<()> {
        self.motion("pick", position_name, labware_type).await
    }

    async fn place(&self, position_name: &str, labware_type: &str) -> DeviceResult<()> {
        self.motion("place", position_name, labware_type).await
    }

    async fn get_taught_positions(&self) -> DeviceResult<Vec<String>> {
        Ok(self.positions.clone())
    }
}

/// Builds mock drivers from catalog equipment.
///
/// Driver kinds: `mock.arm` (positions from `options.positions`) and
/// `mock.device` (`options.fail_on` names a failing command, `options.panic_on`
/// one that panics). Both accept
/// `options.delay_ms`. Built mocks are kept so tests can inspect them.
#[derive(Default)]
pub struct MockDriverFactory {
    devices: Mutex<Vec<(String, Arc<MockDevice>)>>,
    transporters: Mutex<Vec<(String, Arc<MockTransporter>)>>,
}

impl MockDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, name: &str) -> Option<Arc<MockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| Arc::clone(d))
    }

    pub fn transporter(&self, name: &str) -> Option<Arc<MockTransporter>> {
        self.transporters
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| Arc::clone(t))
    }
}

impl DriverFactory for MockDriverFactory {
    fn build(
        &self,
        definition: &labflow_config::EquipmentDefinition,
    ) -> crate::Result<DeviceHandle> {
        match definition.driver.as_str() {
            "mock.arm" => {
                let positions: Vec<String> = definition
                    .options
                    .get("positions")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let refs: Vec<&str> = positions.iter().map(String::as_str).collect();
                let mock = Arc::new(
                    MockTransporter::new(&definition.name, &refs).with_delay(delay(definition)),
                );
                self.transporters
                    .lock()
                    .push((definition.name.clone(), Arc::clone(&mock)));
                Ok(mock.handle())
            }
            "mock.device" => {
                let mut mock = MockDevice::new(&definition.name).with_delay(delay(definition));
                if let Some(cmd) = definition.options.get("fail_on").and_then(|v| v.as_str()) {
                    mock = mock.failing_on(cmd);
                }
                if let Some(cmd) = definition.options.get("panic_on").and_then(|v| v.as_str()) {
                    mock = mock.panicking_on(cmd);
                }
                let mock = Arc::new(mock);
                self.devices
                    .lock()
                    .push((definition.name.clone(), Arc::clone(&mock)));
                Ok(mock.handle())
            }
            other => Err(crate::EngineError::Config(format!(
                "unknown driver kind '{other}' for '{}'",
                definition.name
            ))),
        }
    }
}

fn delay(definition: &labflow_config::EquipmentDefinition) -> Duration {
    definition
        .options
        .get("delay_ms")
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or_default()
}
