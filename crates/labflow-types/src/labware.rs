//! Physical labware items.

use serde::{Deserialize, Serialize};

use crate::ids::LabwareId;

/// A plate, tube rack, lid or other item tracked as it moves through the lab.
///
/// Name and type are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labware {
    pub id: LabwareId,
    pub name: String,
    pub labware_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
}

impl Labware {
    /// Create a new labware item with a fresh id.
    pub fn new(name: impl Into<String>, labware_type: impl Into<String>) -> Self {
        Self {
            id: LabwareId::new(),
            name: name.into(),
            labware_type: labware_type.into(),
            barcode: None,
        }
    }

    /// Attach a barcode.
    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }
}
