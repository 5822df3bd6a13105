use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::{MountConfig, ResourceLimits};

/// Default PATH for sandbox execution
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/bin:/bin";

/// How to run one language inside a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeProfile {
    /// Language ID, filled in from the configuration table key
    #[serde(skip)]
    pub id: String,

    /// Human-readable name (e.g., "Go 1.22")
    pub name: String,

    /// Alternative identifiers resolving to this profile
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Image reference for container backends
    #[serde(default)]
    pub image: Option<String>,

    /// Command and arguments with placeholders
    /// Placeholders: {source}, {workdir}
    pub entrypoint: Vec<String>,

    /// File name the source is staged under (e.g., "main.go")
    pub source_name: SourceName,

    /// Environment variables pinned for this runtime
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Directory mounts
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    /// PATH environment variable for the sandbox
    ///
    /// Defaults to "/usr/bin:/bin" if not specified.
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Resource limits for this language (overrides defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl RuntimeProfile {
    /// Expand the entrypoint for a sandbox whose work directory is `workdir`
    pub fn expand_entrypoint(&self, workdir: &str) -> Vec<String> {
        let source = format!("{}/{}", workdir.trim_end_matches('/'), self.source_name);
        Self::expand_command(&self.entrypoint, &source, workdir)
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, workdir: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| arg.replace("{source}", source).replace("{workdir}", workdir))
            .collect()
    }

    /// Whether `id` names this profile, ignoring case
    pub fn matches(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(id))
    }
}

/// Bare file name a source is staged as (e.g., "main.go")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceName(String);

impl SourceName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(ConfigError::InvalidSourceName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for SourceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SourceName::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a bare file name without '/' characters",
            )
        })
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn source_name_rejects_all_strings_with_slash(s in ".*/.*") {
            prop_assert!(SourceName::new(&s).is_err());
        }

        #[test]
        fn source_name_accepts_simple_names(s in "[a-zA-Z0-9_-]+\\.[a-z]{1,4}") {
            prop_assert!(SourceName::new(&s).is_ok());
        }

        #[test]
        fn expand_command_length_preserved(cmd_len in 1usize..10) {
            let cmd: Vec<String> = (0..cmd_len).map(|i| format!("arg{i}")).collect();
            let result = RuntimeProfile::expand_command(&cmd, "source", "/box");
            prop_assert_eq!(result.len(), cmd_len);
        }
    }
}
