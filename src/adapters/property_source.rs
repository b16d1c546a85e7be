use config::Config;
use eyre::Result;

use crate::{config::loader::load_settings, ports::config_source::ConfigSource};

/// [`ConfigSource`] over layered `config` crate settings.
///
/// Nested keys use dots (`executors.default.threads`). Arrays are returned
/// comma joined so the list accessors see them like any delimited value.
#[derive(Debug, Clone)]
pub struct PropertySource {
    settings: Config,
}

impl PropertySource {
    pub fn new(settings: Config) -> Self {
        Self { settings }
    }

    /// Same layering as the typed loader: file first, then environment.
    pub fn load(config_path: &str) -> Result<Self> {
        Ok(Self::new(load_settings(config_path)?))
    }

    pub fn settings(&self) -> &Config {
        &self.settings
    }
}

impl ConfigSource for PropertySource {
    fn get_raw(&self, key: &str) -> Option<String> {
        if let Ok(value) = self.settings.get_string(key) {
            return Some(value);
        }
        let items = self.settings.get_array(key).ok()?;
        let joined: Vec<String> = items
            .into_iter()
            .filter_map(|item| item.into_string().ok())
            .collect();
        Some(joined.join(","))
    }
}
