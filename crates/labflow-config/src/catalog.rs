//! The lab catalog: static topology plus method and workflow templates.
//!
//! Templates refer to each other by name only; the engine resolves names
//! through its registries when it instantiates threads and methods.
//!
//! ```toml
//! [[locations]]
//! name = "reader_nest"
//! equipment = "reader_1"
//!
//! [[equipment]]
//! name = "reader_1"
//! driver = "sim.device"
//! locations = ["reader_nest"]
//!
//! [[pools]]
//! name = "readers"
//! members = ["reader_1"]
//!
//! [[methods]]
//! name = "read"
//!
//! [[methods.actions]]
//! name = "read_absorbance"
//! pool = "readers"
//! command = "read"
//! options = { wavelength = 450 }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// A named physical position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDefinition {
    pub name: String,
    /// Device whose nest this location is, if any.
    #[serde(default)]
    pub equipment: Option<String>,
    /// Name the owning device uses for this nest.
    #[serde(default)]
    pub alias: Option<String>,
}

/// A controllable device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentDefinition {
    pub name: String,
    /// Driver kind understood by the driver factory (e.g. "sim.arm").
    pub driver: String,
    /// Locations at which this device works on labware.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Driver-specific settings passed through untouched.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// A set of interchangeable equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub name: String,
    pub members: Vec<String>,
}

/// The kind of labware a thread creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabwareTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub labware_type: String,
    #[serde(default)]
    pub barcode: Option<String>,
}

/// One operation on a resource pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub name: String,
    pub pool: String,
    pub command: String,
    /// Explicit location; required for `pick` / `place`.
    #[serde(default)]
    pub location: Option<String>,
    /// Location the labware is moved to after the command completes.
    #[serde(default)]
    pub output: Option<String>,
    /// Threads that must finish before this action performs.
    #[serde(default)]
    pub co_threads: Vec<String>,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// An ordered sequence of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodTemplate {
    pub name: String,
    /// A junction has no actions of its own; a join supplies the method it waits on.
    #[serde(default)]
    pub junction: bool,
    #[serde(default)]
    pub actions: Vec<ActionTemplate>,
}

/// One labware's path through the lab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadTemplate {
    pub name: String,
    /// Labware template name.
    pub labware: String,
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    /// Method template names, run in order.
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Start `spawn` when `thread`'s `method` reaches IN_PROGRESS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnTemplate {
    pub thread: String,
    pub method: String,
    pub spawn: String,
}

/// When `thread`'s `method` reaches IN_PROGRESS, bind it as the wrapped
/// method of `attach_thread`'s `junction` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTemplate {
    pub thread: String,
    pub method: String,
    pub attach_thread: String,
    pub junction: String,
}

/// Thread templates plus spawn/join wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub threads: Vec<ThreadTemplate>,
    #[serde(default)]
    pub spawns: Vec<SpawnTemplate>,
    #[serde(default)]
    pub joins: Vec<JoinTemplate>,
}

impl WorkflowTemplate {
    pub fn thread(&self, name: &str) -> Option<&ThreadTemplate> {
        self.threads.iter().find(|t| t.name == name)
    }

    /// True if some spawn creates this thread (it is not started up front).
    pub fn is_spawned(&self, thread_name: &str) -> bool {
        self.spawns.iter().any(|s| s.spawn == thread_name)
    }
}

/// The full static catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub locations: Vec<LocationDefinition>,
    pub equipment: Vec<EquipmentDefinition>,
    pub pools: Vec<PoolDefinition>,
    pub labware: Vec<LabwareTemplate>,
    pub methods: Vec<MethodTemplate>,
    pub workflows: Vec<WorkflowTemplate>,
}

/// Load and validate a catalog file.
pub fn load_lab_file(path: &Path) -> Result<LabConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = LabConfig::from_toml(&contents)?;
    config.validate()?;
    Ok(config)
}

impl LabConfig {
    /// Parse from a TOML string without validating.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn location(&self, name: &str) -> Option<&LocationDefinition> {
        self.locations.iter().find(|l| l.name == name)
    }

    pub fn equipment(&self, name: &str) -> Option<&EquipmentDefinition> {
        self.equipment.iter().find(|e| e.name == name)
    }

    pub fn pool(&self, name: &str) -> Option<&PoolDefinition> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn labware(&self, name: &str) -> Option<&LabwareTemplate> {
        self.labware.iter().find(|l| l.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodTemplate> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Check name uniqueness and every cross reference.
    pub fn validate(&self) -> Result<()> {
        // Locations and equipment share the reservation namespace.
        let mut resources = HashSet::new();
        for loc in &self.locations {
            if !resources.insert(loc.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "location",
                    name: loc.name.clone(),
                });
            }
        }
        for eq in &self.equipment {
            if !resources.insert(eq.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "equipment",
                    name: eq.name.clone(),
                });
            }
        }
        unique("pool", self.pools.iter().map(|p| p.name.as_str()))?;
        unique("labware", self.labware.iter().map(|l| l.name.as_str()))?;
        unique("method", self.methods.iter().map(|m| m.name.as_str()))?;
        unique("workflow", self.workflows.iter().map(|w| w.name.as_str()))?;

        for loc in &self.locations {
            if let Some(eq) = &loc.equipment
                && self.equipment(eq).is_none()
            {
                return Err(ConfigError::unknown(
                    "equipment",
                    eq,
                    format!("location '{}'", loc.name),
                ));
            }
        }

        for eq in &self.equipment {
            for loc in &eq.locations {
                self.require_location(loc, || format!("equipment '{}'", eq.name))?;
            }
        }

        for pool in &self.pools {
            if pool.members.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pool '{}' has no members",
                    pool.name
                )));
            }
            for member in &pool.members {
                if self.equipment(member).is_none() {
                    return Err(ConfigError::unknown(
                        "equipment",
                        member,
                        format!("pool '{}'", pool.name),
                    ));
                }
            }
        }

        let thread_names: HashSet<&str> = self
            .workflows
            .iter()
            .flat_map(|w| w.threads.iter().map(|t| t.name.as_str()))
            .collect();

        for method in &self.methods {
            if method.junction && !method.actions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "junction method '{}' must not declare actions",
                    method.name
                )));
            }
            for action in &method.actions {
                let context = || format!("action '{}' in method '{}'", action.name, method.name);
                if self.pool(&action.pool).is_none() {
                    return Err(ConfigError::unknown("pool", &action.pool, context()));
                }
                if let Some(loc) = &action.location {
                    self.require_location(loc, context)?;
                }
                if let Some(loc) = &action.output {
                    self.require_location(loc, context)?;
                }
                if matches!(action.command.as_str(), "pick" | "place") && action.location.is_none()
                {
                    return Err(ConfigError::Invalid(format!(
                        "{} uses '{}' and must name a location",
                        context(),
                        action.command
                    )));
                }
                for co in &action.co_threads {
                    if !thread_names.contains(co.as_str()) {
                        return Err(ConfigError::unknown("thread", co, context()));
                    }
                }
            }
        }

        for workflow in &self.workflows {
            self.validate_workflow(workflow)?;
        }

        Ok(())
    }

    fn validate_workflow(&self, workflow: &WorkflowTemplate) -> Result<()> {
        unique("thread", workflow.threads.iter().map(|t| t.name.as_str()))?;
        let wf = || format!("workflow '{}'", workflow.name);

        for thread in &workflow.threads {
            let context = || format!("thread '{}' in {}", thread.name, wf());
            if self.labware(&thread.labware).is_none() {
                return Err(ConfigError::unknown("labware", &thread.labware, context()));
            }
            self.require_location(&thread.start, context)?;
            if let Some(end) = &thread.end {
                self.require_location(end, context)?;
            }
            for method in &thread.methods {
                if self.method(method).is_none() {
                    return Err(ConfigError::unknown("method", method, context()));
                }
            }
        }

        for spawn in &workflow.spawns {
            self.require_thread_method(workflow, &spawn.thread, &spawn.method)?;
            if workflow.thread(&spawn.spawn).is_none() {
                return Err(ConfigError::unknown("thread", &spawn.spawn, format!("spawn in {}", wf())));
            }
        }

        for join in &workflow.joins {
            self.require_thread_method(workflow, &join.thread, &join.method)?;
            self.require_thread_method(workflow, &join.attach_thread, &join.junction)?;
            let junction = self.method(&join.junction).map(|m| m.junction).unwrap_or(false);
            if !junction {
                return Err(ConfigError::Invalid(format!(
                    "join target '{}' in {} is not a junction method",
                    join.junction,
                    wf()
                )));
            }
        }

        Ok(())
    }

    fn require_location(&self, name: &str, context: impl FnOnce() -> String) -> Result<()> {
        if self.location(name).is_none() {
            return Err(ConfigError::unknown("location", name, context()));
        }
        Ok(())
    }

    fn require_thread_method(
        &self,
        workflow: &WorkflowTemplate,
        thread: &str,
        method: &str,
    ) -> Result<()> {
        let context = || format!("workflow '{}'", workflow.name);
        let template = workflow
            .thread(thread)
            .ok_or_else(|| ConfigError::unknown("thread", thread, context()))?;
        if !template.methods.iter().any(|m| m == method) {
            return Err(ConfigError::unknown(
                "method",
                method,
                format!("thread '{}' in {}", thread, context()),
            ));
        }
        Ok(())
    }
}

fn unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAB: &str = r#"
[[locations]]
name = "hotel"

[[locations]]
name = "reader_nest"
equipment = "reader_1"

[[equipment]]
name = "arm"
driver = "sim.arm"

[[equipment]]
name = "reader_1"
driver = "sim.device"
locations = ["reader_nest"]
options = { delay_ms = 5 }

[[pools]]
name = "readers"
members = ["reader_1"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "read"

[[methods.actions]]
name = "read_absorbance"
pool = "readers"
command = "read"
options = { wavelength = 450 }

[[methods]]
name = "await_lid"
junction = true

[[workflows]]
name = "assay"

[[workflows.threads]]
name = "sample"
labware = "plate"
start = "hotel"
end = "hotel"
methods = ["read", "await_lid"]

[[workflows.threads]]
name = "lid"
labware = "plate"
start = "reader_nest"
methods = ["read"]

[[workflows.spawns]]
thread = "sample"
method = "read"
spawn = "lid"

[[workflows.joins]]
thread = "lid"
method = "read"
attach_thread = "sample"
junction = "await_lid"
"#;

    #[test]
    fn test_parse_and_validate() {
        let config = LabConfig::from_toml(LAB).unwrap();
        config.validate().unwrap();

        assert_eq!(config.locations.len(), 2);
        assert_eq!(config.labware("plate").unwrap().labware_type, "96_well");
        let action = &config.method("read").unwrap().actions[0];
        assert_eq!(action.options["wavelength"], serde_json::json!(450));
        let workflow = config.workflow("assay").unwrap();
        assert!(workflow.is_spawned("lid"));
        assert!(!workflow.is_spawned("sample"));
    }

    #[test]
    fn test_duplicate_resource_names_rejected() {
        let mut config = LabConfig::from_toml(LAB).unwrap();
        config.equipment[0].name = "hotel".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { kind: "equipment", .. }));
    }

    #[test]
    fn test_unknown_pool_member_rejected() {
        let mut config = LabConfig::from_toml(LAB).unwrap();
        config.pools[0].members.push("ghost".to_string());
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::UnknownReference { kind, name, .. } => {
                assert_eq!(kind, "equipment");
                assert_eq!(name, "ghost");
            }
            other => panic!("Expected UnknownReference, got: {other:?}"),
        }
    }

    #[test]
    fn test_pick_requires_location() {
        let mut config = LabConfig::from_toml(LAB).unwrap();
        config.methods[0].actions[0].command = "pick".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_join_must_target_junction() {
        let mut config = LabConfig::from_toml(LAB).unwrap();
        config.methods[1].junction = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a junction"));
    }

    #[test]
    fn test_spawn_method_must_belong_to_thread() {
        let mut config = LabConfig::from_toml(LAB).unwrap();
        config.workflows[0].spawns[0].method = "await_lid".to_string();
        config.workflows[0].threads[0].methods = vec!["read".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { kind: "method", .. }));
    }
}
