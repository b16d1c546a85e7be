use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix for environment overrides, e.g. `STREAMGATE_MAX_CONTENT_LENGTH=1024`
/// or `STREAMGATE_EXECUTORS__DEFAULT__THREADS=8`
pub const ENV_PREFIX: &str = "STREAMGATE";

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, INI
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let settings = load_settings(config_path)?;
    let server_config: ServerConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {config_path}"))?;
    Ok(server_config)
}

/// Layered settings: the file, then `STREAMGATE_*` environment overrides.
/// A missing file is an error.
pub fn load_settings(config_path: &str) -> Result<Config> {
    let path = Path::new(config_path);

    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))
}
