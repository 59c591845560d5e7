//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize config.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Two catalog entries share a name.
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    /// A catalog entry references something that does not exist.
    #[error("unknown {kind} '{name}' (referenced by {context})")]
    UnknownReference {
        kind: &'static str,
        name: String,
        context: String,
    },

    /// A value is present but not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn unknown(
        kind: &'static str,
        name: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::UnknownReference {
            kind,
            name: name.into(),
            context: context.into(),
        }
    }
}
