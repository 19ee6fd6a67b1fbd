// Thread-safe variable storage

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_yaml::Value;

use crate::output::ArmadaError;

/// Keyed variable storage shared between the engine and the module layer.
///
/// Reads take a shared lock and return snapshots; `merge` refuses to
/// overwrite existing keys.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: RwLock<HashMap<String, Value>>,
}

impl VarStore {
    pub fn new() -> Self {
        VarStore::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.vars.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.read().get(key).cloned()
    }

    pub fn delete(&self, key: &str) {
        self.vars.write().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.read().contains_key(key)
    }

    /// Snapshot copy of every variable
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.vars.read().clone()
    }

    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.read().is_empty()
    }

    /// Merge a map into the store.
    ///
    /// Fails if any incoming key already exists; on conflict the store is
    /// left completely unchanged.
    pub fn merge(&self, incoming: HashMap<String, Value>) -> Result<(), ArmadaError> {
        let mut vars = self.vars.write();

        for key in incoming.keys() {
            if vars.contains_key(key) {
                return Err(ArmadaError::Vars {
                    message: format!("variable '{}' already exists", key),
                });
            }
        }

        vars.extend(incoming);
        Ok(())
    }
}
