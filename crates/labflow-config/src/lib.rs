//! Configuration system for the labflow workflow engine.
//!
//! Two kinds of configuration live here:
//! - Engine settings (`[engine]`, `[logging]`), discovered and layered from
//!   the user config directory and a project-local `labflow.toml`.
//! - The lab catalog: locations, equipment, resource pools, labware, method
//!   and workflow templates, loaded from an explicit file and validated as a
//!   whole before the engine builds anything from it.

pub mod catalog;
pub mod discovery;
pub mod error;
pub mod types;

pub use catalog::{
    ActionTemplate, EquipmentDefinition, JoinTemplate, LabConfig, LabwareTemplate,
    LocationDefinition, MethodTemplate, PoolDefinition, SpawnTemplate, ThreadTemplate,
    WorkflowTemplate, load_lab_file,
};
pub use discovery::{Layer, LoadedConfig, discover, load_config_file, user_config_dir};
pub use error::{ConfigError, Result};
pub use types::{EngineConfig, LabflowConfig, LoggingConfig};
