use std::net::SocketAddr;

use crate::config::models::{ExecutorConfig, ServerConfig, StaticFilesConfig};

/// Qualifiers the runtime resolves at startup
pub const REQUIRED_EXECUTORS: [&str; 3] = ["default", "manage", "scheduled"];

/// Upper bound on worker threads per executor
const MAX_THREADS: usize = 1024;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.max_content_length == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_content_length".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        if config
            .executors
            .get("scheduled")
            .is_some_and(|scheduled| scheduled.threads == 0)
        {
            errors.push(ValidationError::InvalidField {
                field: "executors.scheduled.threads".to_string(),
                message: "Schedules need a worker pool; threads must be greater than zero"
                    .to_string(),
            });
        }

        for name in REQUIRED_EXECUTORS {
            if !config.executors.contains_key(name) {
                errors.push(ValidationError::MissingField {
                    field: format!("executors.{name}"),
                });
            }
        }

        let mut names: Vec<&String> = config.executors.keys().collect();
        names.sort();
        for name in names {
            if let Err(mut executor_errors) =
                Self::validate_executor(name, &config.executors[name])
            {
                errors.append(&mut executor_errors);
            }
        }

        if let Some(static_files) = &config.static_files {
            if let Err(mut static_errors) = Self::validate_static_files(static_files) {
                errors.append(&mut static_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_executor(name: &str, config: &ExecutorConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if name.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "executors".to_string(),
                message: "Executor names must not be empty".to_string(),
            });
        }

        if config.threads > MAX_THREADS {
            errors.push(ValidationError::InvalidField {
                field: format!("executors.{name}.threads"),
                message: format!("At most {MAX_THREADS} threads are allowed"),
            });
        }

        if config.buffer_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("executors.{name}.buffer_size"),
                message: "Must be greater than zero".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_static_files(config: &StaticFilesConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !std::path::Path::new(&config.root).is_dir() {
            errors.push(ValidationError::InvalidField {
                field: "static_files.root".to_string(),
                message: format!("Static root directory '{}' does not exist", config.root),
            });
        }

        if !config.url_prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "static_files.url_prefix".to_string(),
                message: "URL prefix must start with '/'".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Format multiple validation errors into a readable message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_defaults() {
        assert!(ServerConfigValidator::validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let config = ServerConfig::builder().listen_addr("localhost").build();
        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("localhost"));
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = ServerConfig::builder()
            .max_content_length(0)
            .executor("default", 2, 0)
            .build();
        config.executors.remove("manage");

        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("Found 3 validation errors"), "{message}");
        assert!(message.contains("max_content_length"));
        assert!(message.contains("executors.manage"));
        assert!(message.contains("executors.default.buffer_size"));
    }

    #[test]
    fn validate_rejects_inline_scheduled_executor() {
        let config = ServerConfig::builder().executor("scheduled", 0, 8).build();
        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("executors.scheduled.threads"), "{message}");
    }

    #[test]
    fn validate_checks_static_root_exists() {
        let dir = tempfile::tempdir().unwrap();
        let ok = ServerConfig::builder()
            .static_files(StaticFilesConfig {
                root: dir.path().to_string_lossy().into_owned(),
                url_prefix: "/static".to_string(),
            })
            .build();
        assert!(ServerConfigValidator::validate(&ok).is_ok());

        let missing = ServerConfig::builder()
            .static_files(StaticFilesConfig {
                root: dir.path().join("nope").to_string_lossy().into_owned(),
                url_prefix: "static".to_string(),
            })
            .build();
        let message = ServerConfigValidator::validate(&missing)
            .unwrap_err()
            .to_string();
        assert!(message.contains("does not exist"));
        assert!(message.contains("must start with '/'"));
    }
}
