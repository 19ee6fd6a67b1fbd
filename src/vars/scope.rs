// Variable scopes with priority and parent chaining

use std::collections::HashMap;
use std::sync::Arc;

use serde_yaml::Value;

use super::VarStore;

/// Scope kinds in ascending priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Env,
    Global,
    Group,
    Host,
    Task,
    Temp,
}

impl ScopeKind {
    /// Baseline lookup priority; a higher value wins
    pub fn base_priority(self) -> i32 {
        match self {
            ScopeKind::Env => -10,
            ScopeKind::Global => 0,
            ScopeKind::Group => 10,
            ScopeKind::Host => 20,
            ScopeKind::Task => 30,
            ScopeKind::Temp => 40,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Env => "env",
            ScopeKind::Global => "global",
            ScopeKind::Group => "group",
            ScopeKind::Host => "host",
            ScopeKind::Task => "task",
            ScopeKind::Temp => "temp",
        }
    }
}

/// A named bag of variables with a kind, a priority and an optional parent.
///
/// Lookup consults the local store first and falls through to the parent
/// chain on miss.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: String,
    pub priority: i32,
    store: VarStore,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn new(kind: ScopeKind, name: impl Into<String>) -> Self {
        Scope {
            kind,
            name: name.into(),
            priority: kind.base_priority(),
            store: VarStore::new(),
            parent: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: Arc<Scope>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.set(key, value);
    }

    pub fn delete(&self, key: &str) {
        self.store.delete(key);
    }

    /// Look up a key here, then up the parent chain
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(val) = self.store.get(key) {
            return Some(val);
        }
        self.parent.as_ref().and_then(|p| p.get(key))
    }

    /// Variables defined directly on this scope, ignoring parents
    pub fn local_vars(&self) -> HashMap<String, Value> {
        self.store.get_all()
    }

    /// Flatten the parent chain, child entries winning
    pub fn get_all(&self) -> HashMap<String, Value> {
        let mut result = match &self.parent {
            Some(parent) => parent.get_all(),
            None => HashMap::new(),
        };
        result.extend(self.store.get_all());
        result
    }
}
