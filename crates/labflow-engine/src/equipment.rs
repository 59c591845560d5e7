//! Equipment, transporters and resource pools.

use std::sync::Arc;

use labflow_types::{
    DeviceError, DeviceHandle, Driver, Labware, LabwareHandoff, LabwareId, LabwarePlaceable,
};
use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::location::Location;

/// A controllable device and the capability subset it exposes.
#[derive(Debug)]
pub struct Equipment {
    name: String,
    locations: Vec<String>,
    device: DeviceHandle,
}

impl Equipment {
    pub fn new(name: impl Into<String>, device: DeviceHandle) -> Self {
        Self {
            name: name.into(),
            locations: Vec::new(),
            device,
        }
    }

    /// Locations at which this device works on labware.
    pub fn with_locations(mut self, locations: Vec<String>) -> Self {
        self.locations = locations;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.device.driver
    }

    pub fn is_initialized(&self) -> bool {
        self.device.driver.is_initialized()
    }

    pub fn is_running(&self) -> bool {
        self.device.driver.is_running()
    }

    pub async fn initialize(&self) -> Result<()> {
        self.device.driver.initialize().await?;
        self.device.driver.connect().await?;
        tracing::debug!(equipment = %self.name, "equipment initialized");
        Ok(())
    }

    /// Run a device command.
    ///
    /// `set_temperature` goes to the temperature capability when the device
    /// has one; every other command goes to the driver.
    pub async fn execute(
        &self,
        command: &str,
        options: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        if command == "set_temperature"
            && let Some(temperature) = &self.device.temperature
        {
            let celsius = options
                .get("celsius")
                .or_else(|| options.get("temperature"))
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| {
                    EngineError::invalid_state(format!(
                        "set_temperature on '{}' needs a numeric 'celsius' option",
                        self.name
                    ))
                })?;
            temperature.set_temperature(celsius).await?;
            return Ok(serde_json::json!({ "celsius": celsius }));
        }
        Ok(self.device.driver.execute(command, options).await?)
    }
}

/// Equipment that moves labware between taught positions.
///
/// At most one pick or place is in flight per unit: both hold the motion
/// lock across the driver call. The unit holds at most one labware.
pub struct TransporterEquipment {
    equipment: Arc<Equipment>,
    motion: tokio::sync::Mutex<()>,
    taught: RwLock<Vec<String>>,
    holding: Mutex<Option<Labware>>,
}

impl TransporterEquipment {
    /// Fails unless the device exposes the transporter capability.
    pub fn new(equipment: Arc<Equipment>) -> Result<Self> {
        if equipment.device().transporter.is_none() {
            return Err(EngineError::invalid_state(format!(
                "equipment '{}' is not a transporter",
                equipment.name()
            )));
        }
        Ok(Self {
            equipment,
            motion: tokio::sync::Mutex::new(()),
            taught: RwLock::new(Vec::new()),
            holding: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.equipment.name()
    }

    pub fn equipment(&self) -> &Arc<Equipment> {
        &self.equipment
    }

    /// Load taught positions from the teachpoint source, or from the driver
    /// when no source is attached.
    pub async fn load_taught_positions(&self) -> Result<()> {
        let positions = match &self.equipment.device().teachpoints {
            Some(source) => source
                .teachpoints()?
                .into_iter()
                .map(|tp| tp.name)
                .collect(),
            None => self.driver()?.get_taught_positions().await?,
        };
        tracing::debug!(
            transporter = %self.name(),
            positions = positions.len(),
            "taught positions loaded"
        );
        *self.taught.write() = positions;
        Ok(())
    }

    /// Replace the taught positions directly.
    pub fn set_taught_positions(&self, positions: Vec<String>) {
        *self.taught.write() = positions;
    }

    pub fn taught_positions(&self) -> Vec<String> {
        self.taught.read().clone()
    }

    pub fn is_taught(&self, position: &str) -> bool {
        self.taught.read().iter().any(|p| p == position)
    }

    /// True if this unit can move between the two positions in one hop.
    pub fn spans(&self, a: &str, b: &str) -> bool {
        let taught = self.taught.read();
        taught.iter().any(|p| p == a) && taught.iter().any(|p| p == b)
    }

    pub fn holding(&self) -> Option<Labware> {
        self.holding.lock().clone()
    }

    pub fn is_holding(&self, labware: LabwareId) -> bool {
        self.holding.lock().as_ref().is_some_and(|l| l.id == labware)
    }

    /// Pick `labware` from `location`.
    ///
    /// `placeable` is the device whose nest the location is, if any; it is
    /// told before and after the motion.
    pub async fn pick(
        &self,
        location: &Location,
        labware: LabwareId,
        placeable: Option<&Arc<dyn LabwarePlaceable>>,
    ) -> Result<Labware> {
        let _motion = self.motion.lock().await;
        self.require_taught(location.name())?;
        if let Some(held) = self.holding() {
            return Err(EngineError::invalid_state(format!(
                "transporter '{}' already holds '{}'",
                self.name(),
                held.name
            )));
        }
        let item = match location.occupant() {
            Some(item) if item.id == labware => item,
            Some(other) => {
                return Err(EngineError::invalid_state(format!(
                    "cannot pick from '{}': holds '{}'",
                    location.name(),
                    other.name
                )));
            }
            None => {
                return Err(EngineError::invalid_state(format!(
                    "cannot pick from '{}': empty",
                    location.name()
                )));
            }
        };

        let handoff = LabwareHandoff::new(&item, location.alias());
        if let Some(device) = placeable {
            device.prepare_for_pick(&handoff).await?;
        }
        tracing::debug!(transporter = %self.name(), location = %location.name(), labware = %item.name, "pick");
        self.driver()?
            .pick(location.name(), &item.labware_type)
            .await?;

        let item = location.take_labware(labware)?;
        *self.holding.lock() = Some(item.clone());

        if let Some(device) = placeable {
            device.notify_picked(&handoff).await?;
        }
        Ok(item)
    }

    /// Place the held labware onto `location`.
    pub async fn place(
        &self,
        location: &Location,
        placeable: Option<&Arc<dyn LabwarePlaceable>>,
    ) -> Result<Labware> {
        let _motion = self.motion.lock().await;
        self.require_taught(location.name())?;
        let item = self.holding().ok_or_else(|| {
            EngineError::invalid_state(format!("transporter '{}' holds nothing", self.name()))
        })?;
        if let Some(occupant) = location.occupant() {
            return Err(EngineError::invalid_state(format!(
                "cannot place onto '{}': occupied by '{}'",
                location.name(),
                occupant.name
            )));
        }

        let handoff = LabwareHandoff::new(&item, location.alias());
        if let Some(device) = placeable {
            device.prepare_for_place(&handoff).await?;
        }
        tracing::debug!(transporter = %self.name(), location = %location.name(), labware = %item.name, "place");
        self.driver()?
            .place(location.name(), &item.labware_type)
            .await?;

        location.put(item.clone())?;
        *self.holding.lock() = None;

        if let Some(device) = placeable {
            device.notify_placed(&handoff).await?;
        }
        Ok(item)
    }

    fn require_taught(&self, position: &str) -> Result<()> {
        if self.is_taught(position) {
            Ok(())
        } else {
            Err(EngineError::PositionNotTaught {
                transporter: self.name().to_string(),
                position: position.to_string(),
            })
        }
    }

    fn driver(&self) -> Result<&Arc<dyn labflow_types::Transporter>> {
        self.equipment
            .device()
            .transporter
            .as_ref()
            .ok_or_else(|| DeviceError::not_initialized(self.name()).into())
    }
}

impl std::fmt::Debug for TransporterEquipment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransporterEquipment")
            .field("name", &self.name())
            .field("taught", &self.taught.read().len())
            .finish()
    }
}

/// Interchangeable equipment, in declaration order.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    name: String,
    members: Vec<String>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}
