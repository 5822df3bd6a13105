//! Language runtime registry.
//!
//! Maps language identifiers and aliases to [`RuntimeProfile`]s. Built once
//! from configuration and read-only afterwards, so it is shared behind an
//! `Arc` without locking.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{Config, RuntimeProfile};
use crate::types::ErrorKind;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UnsupportedLanguage
    }
}

#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    profiles: HashMap<String, Arc<RuntimeProfile>>,
    /// Lowercased alias -> profile id
    aliases: HashMap<String, String>,
}

impl RuntimeRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::default();
        for (id, profile) in &config.languages {
            let mut profile = profile.clone();
            profile.id = id.clone();
            registry.insert(profile);
        }
        registry
    }

    fn insert(&mut self, profile: RuntimeProfile) {
        let key = profile.id.to_lowercase();
        for alias in &profile.aliases {
            self.aliases.insert(alias.to_lowercase(), key.clone());
        }
        self.profiles.insert(key, Arc::new(profile));
    }

    /// Look up a profile by id or alias, ignoring case
    pub fn resolve(&self, language: &str) -> Result<Arc<RuntimeProfile>, RegistryError> {
        let key = language.trim().to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnsupportedLanguage(language.to_owned()))
    }

    /// Sorted list of profiles
    pub fn languages(&self) -> Vec<Arc<RuntimeProfile>> {
        let mut profiles: Vec<_> = self.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
