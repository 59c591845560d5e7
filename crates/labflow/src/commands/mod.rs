//! CLI command handlers.

pub mod route;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context as _, Result};
use labflow_config::{EngineConfig, LabConfig};
use labflow_engine::Engine;

use crate::sim::SimDriverFactory;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Engine settings from the layered config.
    pub engine: EngineConfig,
}

/// Read and validate a lab file.
pub fn load_lab(path: &Path) -> Result<LabConfig> {
    labflow_config::load_lab_file(path)
        .with_context(|| format!("failed to load lab file {}", path.display()))
}

/// Build and initialize an engine over simulated drivers.
pub async fn sim_engine(catalog: LabConfig, ctx: &Context) -> Result<Engine> {
    let factory = SimDriverFactory::new();
    let engine = Engine::from_config(catalog, &factory, ctx.engine.clone()).await?;
    Ok(engine)
}
