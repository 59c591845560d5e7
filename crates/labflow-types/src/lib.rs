//! Shared types for the labflow workflow engine.
//!
//! These types are shared between `labflow-engine` (which drives threads,
//! methods and actions) and device driver crates (which implement the
//! capability traits in [`device`]).

pub mod context;
pub mod device;
pub mod ids;
pub mod labware;
pub mod status;

pub use context::ExecutionContext;
pub use device::{
    DeviceError, DeviceHandle, DeviceResult, Driver, LabwareHandoff, LabwarePlaceable,
    TeachpointSource, Teachpoint, TemperatureControl, Transporter,
};
pub use ids::{ActionId, LabwareId, MethodId, ThreadId, WorkflowId};
pub use labware::Labware;
pub use status::{ActionStatus, LabwareThreadStatus, MethodStatus, WorkflowStatus};
