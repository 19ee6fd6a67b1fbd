// Priority-ordered scope stack

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_yaml::Value;

use super::{Scope, ScopeKind};

/// Holds every live scope, sorted by priority descending.
///
/// `get` walks the list and returns the first hit; an `Env` scope populated
/// from the process environment is materialized lazily so environment
/// variables always sit at the bottom of the stack.
#[derive(Debug, Default)]
pub struct VarManager {
    scopes: RwLock<Vec<Arc<Scope>>>,
}

impl VarManager {
    pub fn new() -> Self {
        VarManager::default()
    }

    /// Insert a scope, keeping the list sorted by priority descending.
    ///
    /// Among equal priorities the earlier-added scope stays first and keeps
    /// winning lookups.
    pub fn add_scope(&self, scope: Arc<Scope>) {
        let mut scopes = self.scopes.write();
        let pos = scopes
            .iter()
            .position(|s| scope.priority > s.priority)
            .unwrap_or(scopes.len());
        scopes.insert(pos, scope);
    }

    pub fn remove_scope(&self, kind: ScopeKind, name: &str) {
        let mut scopes = self.scopes.write();
        if let Some(pos) = scopes.iter().position(|s| s.kind == kind && s.name == name) {
            scopes.remove(pos);
        }
    }

    pub fn scope(&self, kind: ScopeKind, name: &str) -> Option<Arc<Scope>> {
        self.scopes
            .read()
            .iter()
            .find(|s| s.kind == kind && s.name == name)
            .cloned()
    }

    /// Highest-priority binding for a key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.ensure_env_scope();

        let scopes = self.scopes.read();
        scopes.iter().find_map(|s| s.get(key))
    }

    /// Get-or-create a scope of the given kind/name and set variables on it
    fn set_into(&self, kind: ScopeKind, name: &str, vars: HashMap<String, Value>) {
        let scope = match self.scope(kind, name) {
            Some(scope) => scope,
            None => {
                let scope = Arc::new(Scope::new(kind, name));
                self.add_scope(scope.clone());
                scope
            }
        };
        for (k, v) in vars {
            scope.set(k, v);
        }
    }

    pub fn set_global(&self, key: impl Into<String>, value: Value) {
        self.set_into(
            ScopeKind::Global,
            "global",
            HashMap::from([(key.into(), value)]),
        );
    }

    pub fn set_group_vars(&self, group: &str, vars: HashMap<String, Value>) {
        self.set_into(ScopeKind::Group, group, vars);
    }

    pub fn set_host_vars(&self, host: &str, vars: HashMap<String, Value>) {
        self.set_into(ScopeKind::Host, host, vars);
    }

    pub fn set_task_vars(&self, task_id: &str, vars: HashMap<String, Value>) {
        self.set_into(ScopeKind::Task, task_id, vars);
    }

    pub fn set_temp_vars(&self, name: &str, vars: HashMap<String, Value>) {
        self.set_into(ScopeKind::Temp, name, vars);
    }

    /// Merge every scope ascending by priority, process environment at the
    /// bottom; higher-priority bindings overwrite lower ones.
    pub fn get_all_vars(&self) -> HashMap<String, Value> {
        self.ensure_env_scope();

        let mut result: HashMap<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let scopes = self.scopes.read();
        for scope in scopes.iter().rev() {
            result.extend(scope.local_vars());
        }
        result
    }

    fn ensure_env_scope(&self) {
        if self.scope(ScopeKind::Env, "env").is_some() {
            return;
        }

        let scope = Arc::new(Scope::new(ScopeKind::Env, "env"));
        for (k, v) in std::env::vars() {
            scope.set(k, Value::String(v));
        }
        self.add_scope(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(manager: &VarManager, kind: ScopeKind, name: &str, key: &str, value: &str) {
        manager.set_into(
            kind,
            name,
            HashMap::from([(key.to_string(), Value::String(value.to_string()))]),
        );
    }

    #[test]
    fn test_priority_order_wins() {
        let manager = VarManager::new();
        set(&manager, ScopeKind::Global, "global", "color", "blue");
        set(&manager, ScopeKind::Host, "web1", "color", "green");
        set(&manager, ScopeKind::Group, "web", "color", "red");

        // Host (20) beats group (10) beats global (0)
        assert_eq!(manager.get("color"), Some(Value::String("green".into())));

        manager.remove_scope(ScopeKind::Host, "web1");
        assert_eq!(manager.get("color"), Some(Value::String("red".into())));
    }

    #[test]
    fn test_env_overlay_for_unset_keys() {
        let manager = VarManager::new();
        std::env::set_var("ARMADA_TEST_ENV_OVERLAY", "from-env");

        assert_eq!(
            manager.get("ARMADA_TEST_ENV_OVERLAY"),
            Some(Value::String("from-env".into()))
        );

        // Any defined scope outranks the environment
        set(
            &manager,
            ScopeKind::Global,
            "global",
            "ARMADA_TEST_ENV_OVERLAY",
            "from-global",
        );
        assert_eq!(
            manager.get("ARMADA_TEST_ENV_OVERLAY"),
            Some(Value::String("from-global".into()))
        );
        std::env::remove_var("ARMADA_TEST_ENV_OVERLAY");
    }

    #[test]
    fn test_get_all_vars_merges_ascending() {
        let manager = VarManager::new();
        set(&manager, ScopeKind::Global, "global", "a", "global");
        set(&manager, ScopeKind::Task, "t1", "a", "task");
        set(&manager, ScopeKind::Group, "web", "b", "group");

        let all = manager.get_all_vars();
        assert_eq!(all.get("a"), Some(&Value::String("task".into())));
        assert_eq!(all.get("b"), Some(&Value::String("group".into())));
    }

    #[test]
    fn test_scope_lifetime_follows_owner() {
        let manager = VarManager::new();
        set(&manager, ScopeKind::Task, "deploy@web1", "attempt", "1");

        assert!(manager.scope(ScopeKind::Task, "deploy@web1").is_some());
        manager.remove_scope(ScopeKind::Task, "deploy@web1");
        assert!(manager.get("attempt").is_none());
    }
}
