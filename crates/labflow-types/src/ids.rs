//! Stable identifiers for runtime entities.
//!
//! Templates refer to each other by name; instances are keyed by these ids
//! and resolved through the engine's registry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a running workflow.
    WorkflowId
);
entity_id!(
    /// Unique identifier for a labware thread.
    ThreadId
);
entity_id!(
    /// Unique identifier for a method instance.
    MethodId
);
entity_id!(
    /// Unique identifier for an action instance.
    ActionId
);
entity_id!(
    /// Unique identifier for a physical labware item.
    LabwareId
);
