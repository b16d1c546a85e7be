//! Request-scoped property bag: string keys, values of any type.
use std::{
    any::{Any, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;
use thiserror::Error;

/// Attribute holding an alternative path to route on (e.g. a normalised one).
pub const PATH_OVERRIDE: &str = "streamgate.path-override";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttributeError {
    #[error("Attribute '{0}' is not set")]
    Missing(String),

    #[error("Attribute '{key}' holds {actual}, not {requested}")]
    TypeMismatch {
        key: String,
        actual: &'static str,
        requested: &'static str,
    },
}

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Last write wins. Values are shared, reads hand out clones.
#[derive(Default, Clone)]
pub struct Attributes {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries.write().insert(
            key.into(),
            Entry {
                value: Arc::new(value),
                type_name: type_name::<T>(),
            },
        );
    }

    /// Typed read; fails if the key is absent or holds another type.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Result<T, AttributeError> {
        self.get_shared::<T>(key).map(|value| (*value).clone())
    }

    pub fn get_shared<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, AttributeError> {
        let entry = self
            .entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| AttributeError::Missing(key.to_string()))?;
        entry
            .value
            .downcast::<T>()
            .map_err(|_| AttributeError::TypeMismatch {
                key: key.to_string(),
                actual: entry.type_name,
                requested: type_name::<T>(),
            })
    }

    /// Typed read that treats absence as `None` but still rejects a type mismatch.
    pub fn find<T: Any + Send + Sync + Clone>(&self, key: &str) -> Result<Option<T>, AttributeError> {
        match self.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(AttributeError::Missing(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_map()
            .entries(entries.iter().map(|(k, v)| (k, v.type_name)))
            .finish()
    }
}
