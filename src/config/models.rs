//! Configuration data structures for streamgate.
//!
//! These types map directly to TOML (also JSON / YAML / INI) configuration files. Every field
//! has a default so an empty file is a valid configuration. The camelCase aliases accept the
//! key names used by earlier deployments (`maxContentLength`, `caseInsensitiveMatching`,
//! `debugRequestRouting`).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::router::RouterOptions;

/// Default request body cap: 10 MiB
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 10 * 1024 * 1024;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_content_length() -> u64 {
    DEFAULT_MAX_CONTENT_LENGTH
}

fn default_buffer_size() -> usize {
    256
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_executors() -> HashMap<String, ExecutorConfig> {
    HashMap::from([
        ("default".to_string(), ExecutorConfig::default()),
        (
            "manage".to_string(),
            ExecutorConfig {
                threads: 1,
                ..ExecutorConfig::default()
            },
        ),
        (
            "scheduled".to_string(),
            ExecutorConfig {
                threads: 1,
                ..ExecutorConfig::default()
            },
        ),
    ])
}

/// Sizing for one named executor
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads; `0` runs tasks inline on the submitting thread
    pub threads: usize,
    /// Queue capacity of parallel stages processing on this executor
    #[serde(alias = "bufferSize")]
    pub buffer_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Directory served by file-backed response bodies
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StaticFilesConfig {
    /// Root directory; resolved paths may not leave it
    pub root: String,
    /// URL prefix the files are mounted under (e.g., "/static")
    pub url_prefix: String,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            root: "./static".to_string(),
            url_prefix: "/static".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Request body cap in bytes
    #[serde(default = "default_max_content_length", alias = "maxContentLength")]
    pub max_content_length: u64,
    #[serde(default, alias = "caseInsensitiveMatching")]
    pub case_insensitive_matching: bool,
    /// Return routing trace headers with every response
    #[serde(default, alias = "debugRequestRouting")]
    pub debug_request_routing: bool,
    /// Named executors; `default`, `manage` and `scheduled` are required
    #[serde(default = "default_executors")]
    pub executors: HashMap<String, ExecutorConfig>,
    #[serde(default)]
    pub static_files: Option<StaticFilesConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Router behaviour selected by this configuration
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            case_insensitive: self.case_insensitive_matching,
            debug_routing: self.debug_request_routing,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_content_length: default_max_content_length(),
            case_insensitive_matching: false,
            debug_request_routing: false,
            executors: default_executors(),
            static_files: None,
        }
    }
}

/// Builder for ServerConfig, starting from the defaults
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the request body cap
    pub fn max_content_length(mut self, bytes: u64) -> Self {
        self.config.max_content_length = bytes;
        self
    }

    pub fn case_insensitive_matching(mut self, enabled: bool) -> Self {
        self.config.case_insensitive_matching = enabled;
        self
    }

    pub fn debug_request_routing(mut self, enabled: bool) -> Self {
        self.config.debug_request_routing = enabled;
        self
    }

    /// Add or replace a named executor
    pub fn executor(mut self, name: impl Into<String>, threads: usize, buffer_size: usize) -> Self {
        self.config.executors.insert(
            name.into(),
            ExecutorConfig {
                threads,
                buffer_size,
            },
        );
        self
    }

    /// Set static files configuration
    pub fn static_files(mut self, config: StaticFilesConfig) -> Self {
        self.config.static_files = Some(config);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.max_content_length, DEFAULT_MAX_CONTENT_LENGTH);
        assert!(!config.case_insensitive_matching);
        for name in ["default", "manage", "scheduled"] {
            assert!(config.executors.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_camel_case_aliases() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"maxContentLength": 512, "caseInsensitiveMatching": true, "debugRequestRouting": true}"#,
        )
        .unwrap();
        assert_eq!(config.max_content_length, 512);
        let options = config.router_options();
        assert!(options.case_insensitive);
        assert!(options.debug_routing);
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .listen_addr("0.0.0.0:9000")
            .max_content_length(1024)
            .executor("default", 0, 16)
            .build();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.executors["default"].threads, 0);
        assert_eq!(config.executors.len(), 3);
    }
}
