use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("Too many bindings stored")]
    TooManyEntries,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid value")]
    InvalidValue,
}

/// Local key-value bindings, last-writer-wins. Keys and values must stay
/// legal on the wire (no frame separators), which is enforced here so a
/// stored binding can always be served back.
#[derive(Clone, Debug)]
pub struct Storage {
    config: StorageConfig,
    bindings: HashMap<String, String>,
}

fn wire_legal(data: &str) -> bool {
    !data.bytes().any(|b| b == b'|' || b == b'\n')
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Storage {
            config,
            bindings: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.bindings.get(key)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn check_entry(config: &StorageConfig, key: &str, value: &str) -> Result<(), Error> {
        if key.is_empty() || key.len() > config.max_key_size || !wire_legal(key) {
            Err(Error::InvalidKey)
        } else if value.len() > config.max_value_size || !wire_legal(value) {
            Err(Error::InvalidValue)
        } else {
            Ok(())
        }
    }

    pub fn insert(&mut self, key: String, value: String) -> Result<(), Error> {
        Self::check_entry(&self.config, &key, &value)?;

        if self.bindings.len() >= self.config.max_entries && !self.bindings.contains_key(&key) {
            info!("Rejecting binding for {key:?}, store is full");
            return Err(Error::TooManyEntries);
        }
        self.bindings.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.bindings.remove(key).is_some()
    }
}
