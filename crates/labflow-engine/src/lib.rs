//! Workflow execution engine for labflow.
//!
//! Labware items move between locations on transporters while methods run
//! device commands on them. Each item is a [`LabwareThread`] running as its
//! own task; threads compete for locations, equipment and transporters
//! through the [`ReservationManager`], which grants claims first come first
//! served and breaks wait cycles. The [`Router`] plans multi-hop moves, and
//! every status change is published on the [`EventBus`], where spawn and join
//! handlers reshape the running workflow.
//!
//! ```text
//! Engine ─┬─ Lab (locations, equipment, transporters, pools)
//!         ├─ ReservationManager ── Router
//!         ├─ EventBus ── StatusManager ── Spawn/Join handlers
//!         └─ Registry (workflows → threads → methods → actions)
//! ```

pub mod action;
pub mod engine;
pub mod equipment;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lab;
pub mod location;
pub mod manager;
pub mod method;
pub mod registry;
pub mod reservation;
pub mod router;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod thread;
pub mod workflow;

pub use action::{Action, Resolution};
pub use engine::{Engine, WeakEngine};
pub use equipment::{Equipment, ResourcePool, TransporterEquipment};
pub use error::{EngineError, Result};
pub use events::{BusEvent, EventBus, EventHandler, SubscriptionId};
pub use handlers::{JoinHandler, METHOD_IN_PROGRESS, SpawnHandler};
pub use lab::{DriverFactory, Lab, LabBuilder};
pub use location::Location;
pub use manager::{RunReport, ThreadManager, ThreadReport};
pub use method::MethodInstance;
pub use registry::Registry;
pub use reservation::{RequestState, ReservationManager, ReservationOutcome, ReservationRequest};
pub use router::{Route, RouteStep, Router};
pub use status::{EntityKind, StatusManager};
pub use thread::{LabwarePosition, LabwareThread};
pub use workflow::{JunctionBindings, WorkflowInstance};
