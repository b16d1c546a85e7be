use std::{collections::BTreeSet, str::FromStr};

use thiserror::Error;

/// Error type for typed configuration lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Key is not set
    #[error("Missing configuration key: {0}")]
    Missing(String),

    /// Value is set but does not convert to the requested type
    #[error("Invalid value '{value}' for configuration key '{key}': expected {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// ConfigSource defines the port (interface) for string keyed configuration
pub trait ConfigSource: Send + Sync {
    /// Raw value for a key, if set
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Typed accessors available on every [`ConfigSource`].
pub trait ConfigSourceExt: ConfigSource {
    fn get<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        let raw = self
            .get_raw(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Typed value, or `default` when the key is not set.
    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Err(ConfigError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    /// Accepts `true/false`, `yes/no`, `on/off` and `1/0`, any case.
    fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self
            .get_raw(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
                expected: "bool",
            }),
        }
    }

    /// Comma separated list; blank items are skipped. Unset yields an empty list.
    fn get_list(&self, key: &str) -> Vec<String> {
        self.get_raw(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_set(&self, key: &str) -> BTreeSet<String> {
        self.get_list(key).into_iter().collect()
    }
}

impl<S: ConfigSource + ?Sized> ConfigSourceExt for S {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapSource(HashMap<&'static str, &'static str>);

    impl ConfigSource for MapSource {
        fn get_raw(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    fn source() -> MapSource {
        MapSource(HashMap::from([
            ("maxContentLength", " 1024 "),
            ("debugRequestRouting", "Yes"),
            ("hosts", "a, b,,a ,c"),
            ("threads", "many"),
        ]))
    }

    #[test]
    fn test_typed_lookup() {
        let source = source();
        assert_eq!(source.get::<u64>("maxContentLength").unwrap(), 1024);
        assert_eq!(source.get_or("missing", 7u32).unwrap(), 7);
        assert!(source.get_bool("debugRequestRouting").unwrap());
        assert!(matches!(
            source.get::<usize>("threads"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            source.get_or("threads", 1usize),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_list_and_set() {
        let source = source();
        assert_eq!(source.get_list("hosts"), vec!["a", "b", "a", "c"]);
        assert_eq!(source.get_set("hosts").len(), 3);
        assert!(source.get_list("missing").is_empty());
    }
}
