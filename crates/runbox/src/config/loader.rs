//! Configuration file loading for runbox
//!
//! Handles loading and parsing configuration files using the config crate.
//! Values from the file can be overridden by `RUNBOX_`-prefixed environment
//! variables, with `__` separating nested keys (e.g. `RUNBOX_BACKEND__KIND=local`).

use std::collections::HashSet;
use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{BackendKind, Config, ConfigError};

impl Config {
    /// Load configuration from a file, applying environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("RUNBOX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::finish(config.try_deserialize()?)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        Self::finish(config.try_deserialize()?)
    }

    fn finish(mut config: Config) -> Result<Self, ConfigError> {
        for (id, profile) in config.languages.iter_mut() {
            profile.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be greater than zero".to_owned(),
            ));
        }
        if self.name_prefix.is_empty() {
            return Err(ConfigError::Invalid("name_prefix must not be empty".to_owned()));
        }
        if self.reaper.enabled && self.reaper.interval == 0 {
            return Err(ConfigError::Invalid(
                "reaper interval must be greater than zero".to_owned(),
            ));
        }
        if self.backend.kind == BackendKind::Isolate && self.backend.isolate.box_count == 0 {
            return Err(ConfigError::Invalid(
                "isolate box_count must be greater than zero".to_owned(),
            ));
        }

        match self.max_limits.wall_time {
            Some(secs) if secs.is_finite() && secs > 0.0 => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "max_limits.wall_time must be a positive number of seconds".to_owned(),
                ));
            }
        }
        for (table, limits) in [
            ("default_limits", &self.default_limits),
            ("max_limits", &self.max_limits),
        ] {
            for (field, value) in [
                ("cpu_time", limits.cpu_time),
                ("wall_time", limits.wall_time),
                ("grace_period", limits.grace_period),
            ] {
                if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "{table}.{field} must be a non-negative number of seconds"
                    )));
                }
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        for id in self.languages.keys() {
            if !seen.insert(id.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' differs from another language only in case"
                )));
            }
        }

        for (id, profile) in &self.languages {
            if profile.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if profile.entrypoint.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty entrypoint"
                )));
            }
            if self.backend.kind == BackendKind::Docker
                && profile.image.as_deref().is_none_or(str::is_empty)
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has no image (required by the docker backend)"
                )));
            }
            for alias in &profile.aliases {
                if !seen.insert(alias.to_lowercase()) {
                    return Err(ConfigError::Invalid(format!(
                        "alias '{alias}' of language '{id}' is already in use"
                    )));
                }
            }
        }

        Ok(())
    }
}
