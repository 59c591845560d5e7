//! Settings discovery.
//!
//! Two optional layers are read, lowest precedence first:
//! 1. `config.toml` in the user config directory (`--config`,
//!    `$LABFLOW_CONFIG_DIR`, or the platform config dir + `labflow/`)
//! 2. `labflow.toml` in the project directory
//!
//! A layer replaces whole sections of the layers below it. A layer that
//! cannot be read, parsed or validated is skipped with a warning; the engine
//! then runs on whatever the remaining layers and defaults give it.

use std::path::{Path, PathBuf};

use crate::{ConfigError, LabflowConfig, Result};

const APP_NAME: &str = "labflow";
const CONFIG_DIR_ENV: &str = "LABFLOW_CONFIG_DIR";

/// One settings file in the discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    User,
    Project,
}

impl Layer {
    pub fn file_name(self) -> &'static str {
        match self {
            Layer::User => "config.toml",
            Layer::Project => "labflow.toml",
        }
    }
}

/// Merged settings plus what discovery saw on the way.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: LabflowConfig,
    /// Files that were merged, lowest precedence first.
    pub loaded_from: Vec<PathBuf>,
    /// One line per skipped layer.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    fn apply(&mut self, layer: Layer, path: PathBuf) {
        if !path.is_file() {
            tracing::trace!(?layer, path = %path.display(), "no settings file");
            return;
        }
        match load_config_file(&path) {
            Ok(settings) => {
                tracing::debug!(?layer, path = %path.display(), "settings layer loaded");
                self.config.merge(settings);
                self.loaded_from.push(path);
            }
            Err(err) => self
                .warnings
                .push(format!("ignoring {}: {err}", path.display())),
        }
    }
}

/// Discover and merge the settings layers.
///
/// `config_dir` replaces the user config directory lookup; `project_dir`
/// defaults to the working directory.
pub fn discover(project_dir: Option<&Path>, config_dir: Option<&Path>) -> LoadedConfig {
    let mut loaded = LoadedConfig::default();

    let user_dir = config_dir.map(Path::to_path_buf).or_else(user_config_dir);
    if let Some(dir) = user_dir {
        loaded.apply(Layer::User, dir.join(Layer::User.file_name()));
    }

    let project = project_dir.unwrap_or_else(|| Path::new("."));
    loaded.apply(Layer::Project, project.join(Layer::Project.file_name()));

    loaded
}

/// Read, parse and validate one settings file.
pub fn load_config_file(path: &Path) -> Result<LabflowConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = LabflowConfig::from_toml(&contents)?;
    if let Some(engine) = &config.engine {
        engine.validate()?;
    }
    Ok(config)
}

/// The user config directory: `$LABFLOW_CONFIG_DIR` when set and non-empty,
/// otherwise `labflow/` under the platform config dir.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn dirs_with(user: Option<&str>, project: Option<&str>) -> (TempDir, TempDir) {
        let user_dir = TempDir::new().unwrap();
        let project_dir = TempDir::new().unwrap();
        if let Some(text) = user {
            fs::write(user_dir.path().join("config.toml"), text).unwrap();
        }
        if let Some(text) = project {
            fs::write(project_dir.path().join("labflow.toml"), text).unwrap();
        }
        (user_dir, project_dir)
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_config_file(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_no_layers_gives_defaults() {
        let (user, project) = dirs_with(None, None);
        let loaded = discover(Some(project.path()), Some(user.path()));
        assert!(loaded.loaded_from.is_empty());
        assert!(loaded.warnings.is_empty());
        assert_eq!(loaded.config.engine(), crate::EngineConfig::default());
    }

    #[test]
    fn test_project_layer_overrides_user_layer() {
        let (user, project) = dirs_with(
            Some("[engine]\npoll_interval_ms = 10\n\n[logging]\nlevel = \"info\"\n"),
            Some("[engine]\npoll_interval_ms = 20\n"),
        );

        let loaded = discover(Some(project.path()), Some(user.path()));
        assert_eq!(loaded.config.engine().poll_interval_ms, 20);
        assert_eq!(loaded.config.logging().level.as_deref(), Some("info"));
        assert_eq!(
            loaded.loaded_from,
            vec![
                user.path().join("config.toml"),
                project.path().join("labflow.toml"),
            ]
        );
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_malformed_layer_becomes_warning() {
        let (user, project) = dirs_with(Some("[engine\n"), None);
        let loaded = discover(Some(project.path()), Some(user.path()));
        assert!(loaded.loaded_from.is_empty());
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.config.engine(), crate::EngineConfig::default());
    }

    #[test]
    fn test_unusable_engine_values_skip_the_layer() {
        let (user, project) = dirs_with(
            Some("[engine]\npoll_interval_ms = 30\n"),
            Some("[engine]\nevent_feed_capacity = 0\n"),
        );

        let loaded = discover(Some(project.path()), Some(user.path()));
        assert_eq!(loaded.loaded_from, vec![user.path().join("config.toml")]);
        assert_eq!(loaded.config.engine().poll_interval_ms, 30);
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("event_feed_capacity"));
    }

    #[test]
    fn test_load_config_file_validates_engine() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labflow.toml");
        fs::write(&path, "[engine]\navailability_poll_ms = 0\n").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("availability_poll_ms")));
    }
}
