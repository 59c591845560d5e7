//! Named positions that hold at most one labware.

use labflow_types::{Labware, LabwareId};
use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// A physical position (teachpoint).
///
/// Occupancy changes only through [`Location::put`] and [`Location::take`],
/// each of which checks and updates in one step, so the occupant is never
/// ambiguous. Waiters observe changes through [`Location::watch`].
#[derive(Debug)]
pub struct Location {
    name: String,
    equipment: Option<String>,
    alias: Option<String>,
    occupant: watch::Sender<Option<Labware>>,
}

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            equipment: None,
            alias: None,
            occupant: watch::Sender::new(None),
        }
    }

    /// Mark this location as a nest of `equipment`.
    pub fn with_equipment(mut self, equipment: impl Into<String>) -> Self {
        self.equipment = Some(equipment.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn equipment(&self) -> Option<&str> {
        self.equipment.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn occupant(&self) -> Option<Labware> {
        self.occupant.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.occupant.borrow().is_none()
    }

    pub fn holds(&self, labware: LabwareId) -> bool {
        self.occupant
            .borrow()
            .as_ref()
            .is_some_and(|l| l.id == labware)
    }

    /// Place `labware` here. Fails if the location is occupied.
    pub fn put(&self, labware: Labware) -> Result<()> {
        let mut conflict = None;
        let mut incoming = Some(labware);
        self.occupant.send_if_modified(|slot| {
            if let Some(existing) = slot.as_ref() {
                conflict = Some(existing.name.clone());
                return false;
            }
            *slot = incoming.take();
            true
        });
        match conflict {
            Some(existing) => Err(EngineError::invalid_state(format!(
                "cannot place onto '{}': occupied by '{}'",
                self.name, existing
            ))),
            None => Ok(()),
        }
    }

    /// Remove and return the occupant. Fails if the location is empty.
    pub fn take(&self) -> Result<Labware> {
        let mut taken = None;
        self.occupant.send_if_modified(|slot| {
            taken = slot.take();
            taken.is_some()
        });
        taken.ok_or_else(|| {
            EngineError::invalid_state(format!("cannot pick from '{}': empty", self.name))
        })
    }

    /// Remove the occupant only if it is `labware`.
    pub fn take_labware(&self, labware: LabwareId) -> Result<Labware> {
        let mut outcome = Err(EngineError::invalid_state(format!(
            "cannot pick from '{}': empty",
            self.name
        )));
        self.occupant.send_if_modified(|slot| {
            let Some(existing) = slot.as_ref() else {
                return false;
            };
            if existing.id != labware {
                outcome = Err(EngineError::invalid_state(format!(
                    "cannot pick from '{}': holds '{}'",
                    self.name, existing.name
                )));
                return false;
            }
            if let Some(taken) = slot.take() {
                outcome = Ok(taken);
            }
            true
        });
        outcome
    }

    /// Observe occupancy changes.
    pub fn watch(&self) -> watch::Receiver<Option<Labware>> {
        self.occupant.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_take() {
        let loc = Location::new("hotel_1");
        let plate = Labware::new("plate", "96_well");
        loc.put(plate.clone()).unwrap();
        assert!(loc.holds(plate.id));
        assert_eq!(loc.take().unwrap().id, plate.id);
        assert!(loc.is_empty());
    }

    #[test]
    fn test_take_from_empty_fails() {
        let loc = Location::new("hotel_1");
        assert!(matches!(loc.take(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_put_onto_occupied_fails() {
        let loc = Location::new("hotel_1");
        let first = Labware::new("a", "96_well");
        loc.put(first.clone()).unwrap();
        let err = loc.put(Labware::new("b", "96_well")).unwrap_err();
        assert!(err.to_string().contains("occupied"));
        assert!(loc.holds(first.id));
    }

    #[test]
    fn test_take_labware_checks_identity() {
        let loc = Location::new("nest");
        let plate = Labware::new("a", "96_well");
        loc.put(plate.clone()).unwrap();
        assert!(loc.take_labware(Labware::new("b", "96_well").id).is_err());
        assert!(loc.holds(plate.id));
        assert_eq!(loc.take_labware(plate.id).unwrap().id, plate.id);
    }

    #[tokio::test]
    async fn test_watch_sees_release() {
        let loc = std::sync::Arc::new(Location::new("nest"));
        loc.put(Labware::new("a", "96_well")).unwrap();
        let mut rx = loc.watch();

        let l = std::sync::Arc::clone(&loc);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            l.take().unwrap();
        });

        rx.wait_for(|o| o.is_none()).await.unwrap();
        assert!(loc.is_empty());
    }

    #[test]
    fn test_concurrent_puts_single_winner() {
        let loc = std::sync::Arc::new(Location::new("nest"));
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let loc = std::sync::Arc::clone(&loc);
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    loc.put(Labware::new(format!("p{i}"), "96_well")).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
