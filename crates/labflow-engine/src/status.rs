//! Last-known status per entity, with change-only event emission.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use labflow_types::ExecutionContext;
use parking_lot::RwLock;
use serde::Serialize;

use crate::events::EventBus;

/// What kind of entity a status belongs to. Rendered lowercase in event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Workflow,
    Thread,
    Method,
    Action,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workflow => "workflow",
            EntityKind::Thread => "thread",
            EntityKind::Method => "method",
            EntityKind::Action => "action",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records every status transition and publishes it on the bus.
///
/// A change emits `"{kind}.{id}.{status}"` followed by `"{kind}.{status}"`.
/// Setting the status an entity already has emits nothing.
pub struct StatusManager {
    bus: Arc<EventBus>,
    cache: RwLock<HashMap<(EntityKind, String), String>>,
}

impl StatusManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record `status` for `id`. Returns true if it changed (and was emitted).
    pub fn set_status(
        &self,
        kind: EntityKind,
        id: impl fmt::Display,
        status: impl fmt::Display,
        context: &ExecutionContext,
    ) -> bool {
        let id = id.to_string();
        let status = status.to_string();
        {
            let mut cache = self.cache.write();
            let slot = cache.entry((kind, id.clone())).or_default();
            if *slot == status {
                return false;
            }
            slot.clone_from(&status);
        }

        tracing::debug!(kind = %kind, id = %id, status = %status, "status change");
        self.bus.emit(&format!("{kind}.{id}.{status}"), context);
        self.bus.emit(&format!("{kind}.{status}"), context);
        true
    }

    pub fn status(&self, kind: EntityKind, id: impl fmt::Display) -> Option<String> {
        self.cache.read().get(&(kind, id.to_string())).cloned()
    }

    /// Every cached status of one kind, keyed by entity id.
    pub fn snapshot(&self, kind: EntityKind) -> HashMap<String, String> {
        self.cache
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), status)| (id.clone(), status.clone()))
            .collect()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl fmt::Debug for StatusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusManager")
            .field("entries", &self.cache.read().len())
            .finish()
    }
}
