//! Static lab topology: locations, equipment, transporters and pools.

use std::collections::HashMap;
use std::sync::Arc;

use labflow_config::{EquipmentDefinition, LabConfig};
use labflow_types::{DeviceHandle, LabwarePlaceable};

use crate::equipment::{Equipment, ResourcePool, TransporterEquipment};
use crate::error::{EngineError, Result};
use crate::location::Location;

/// Builds driver capability sets for configured equipment.
///
/// Implemented outside the engine (real drivers, simulators, test mocks).
pub trait DriverFactory: Send + Sync {
    fn build(&self, definition: &EquipmentDefinition) -> Result<DeviceHandle>;
}

/// The physical lab the engine drives.
///
/// Location and equipment names share one namespace; each is a reservable
/// resource.
#[derive(Debug)]
pub struct Lab {
    locations: HashMap<String, Arc<Location>>,
    location_order: Vec<String>,
    equipment: HashMap<String, Arc<Equipment>>,
    equipment_order: Vec<String>,
    transporters: Vec<Arc<TransporterEquipment>>,
    pools: HashMap<String, ResourcePool>,
}

impl Lab {
    pub fn builder() -> LabBuilder {
        LabBuilder::default()
    }

    /// Build from a validated catalog, asking `factory` for each driver.
    pub fn from_config(config: &LabConfig, factory: &dyn DriverFactory) -> Result<Self> {
        let mut builder = Lab::builder();
        for def in &config.locations {
            let mut location = Location::new(&def.name);
            if let Some(eq) = &def.equipment {
                location = location.with_equipment(eq);
            }
            if let Some(alias) = &def.alias {
                location = location.with_alias(alias);
            }
            builder = builder.location(location);
        }
        for def in &config.equipment {
            let handle = factory.build(def)?;
            builder = builder.equipment(Equipment::new(&def.name, handle).with_locations(def.locations.clone()));
        }
        for def in &config.pools {
            builder = builder.pool(ResourcePool::new(&def.name, def.members.clone()));
        }
        builder.build()
    }

    /// Initialize and connect every driver, then load taught positions.
    pub async fn initialize(&self) -> Result<()> {
        for name in &self.equipment_order {
            if let Some(equipment) = self.equipment.get(name) {
                equipment.initialize().await?;
            }
        }
        for transporter in &self.transporters {
            transporter.load_taught_positions().await?;
        }
        tracing::info!(
            locations = self.locations.len(),
            equipment = self.equipment.len(),
            transporters = self.transporters.len(),
            "lab initialized"
        );
        Ok(())
    }

    pub fn location(&self, name: &str) -> Result<&Arc<Location>> {
        self.locations
            .get(name)
            .ok_or_else(|| EngineError::not_found("location", name))
    }

    /// Locations in declaration order.
    pub fn locations(&self) -> impl Iterator<Item = &Arc<Location>> {
        self.location_order
            .iter()
            .filter_map(|n| self.locations.get(n))
    }

    pub fn equipment(&self, name: &str) -> Result<&Arc<Equipment>> {
        self.equipment
            .get(name)
            .ok_or_else(|| EngineError::not_found("equipment", name))
    }

    pub fn pool(&self, name: &str) -> Result<&ResourcePool> {
        self.pools
            .get(name)
            .ok_or_else(|| EngineError::not_found("resource pool", name))
    }

    pub fn transporter(&self, name: &str) -> Result<&Arc<TransporterEquipment>> {
        self.transporters
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| EngineError::not_found("transporter", name))
    }

    /// Transporters in registration order.
    pub fn transporters(&self) -> &[Arc<TransporterEquipment>] {
        &self.transporters
    }

    /// The placeable device whose nest `location` is, if any.
    pub fn placeable_at(&self, location: &str) -> Option<Arc<dyn LabwarePlaceable>> {
        let equipment = self.locations.get(location)?.equipment()?;
        self.equipment.get(equipment)?.device().placeable.clone()
    }

    /// Every reservable name: locations, then equipment.
    pub fn resource_names(&self) -> Vec<String> {
        self.location_order
            .iter()
            .chain(self.equipment_order.iter())
            .cloned()
            .collect()
    }
}

/// Incremental construction of a [`Lab`].
#[derive(Default)]
pub struct LabBuilder {
    locations: Vec<Location>,
    equipment: Vec<Equipment>,
    pools: Vec<ResourcePool>,
}

impl LabBuilder {
    pub fn location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    /// Add equipment. Devices with the transporter capability also become
    /// transporters, in the order added.
    pub fn equipment(mut self, equipment: Equipment) -> Self {
        self.equipment.push(equipment);
        self
    }

    pub fn pool(mut self, pool: ResourcePool) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn build(self) -> Result<Lab> {
        let mut lab = Lab {
            locations: HashMap::new(),
            location_order: Vec::new(),
            equipment: HashMap::new(),
            equipment_order: Vec::new(),
            transporters: Vec::new(),
            pools: HashMap::new(),
        };

        for location in self.locations {
            let name = location.name().to_string();
            if lab.locations.contains_key(&name) {
                return Err(EngineError::Config(format!("duplicate location '{name}'")));
            }
            lab.location_order.push(name.clone());
            lab.locations.insert(name, Arc::new(location));
        }

        for equipment in self.equipment {
            let name = equipment.name().to_string();
            if lab.locations.contains_key(&name) || lab.equipment.contains_key(&name) {
                return Err(EngineError::Config(format!(
                    "equipment name '{name}' is already in use"
                )));
            }
            if let Some(missing) = equipment
                .locations()
                .iter()
                .find(|l| !lab.locations.contains_key(*l))
            {
                return Err(EngineError::Config(format!(
                    "equipment '{name}' references unknown location '{missing}'"
                )));
            }
            let equipment = Arc::new(equipment);
            if equipment.device().transporter.is_some() {
                lab.transporters
                    .push(Arc::new(TransporterEquipment::new(Arc::clone(&equipment))?));
            }
            lab.equipment_order.push(name.clone());
            lab.equipment.insert(name, equipment);
        }

        for pool in self.pools {
            if let Some(missing) = pool
                .members()
                .iter()
                .find(|m| !lab.equipment.contains_key(*m))
            {
                return Err(EngineError::Config(format!(
                    "pool '{}' references unknown equipment '{missing}'",
                    pool.name()
                )));
            }
            lab.pools.insert(pool.name().to_string(), pool);
        }

        Ok(lab)
    }
}
