// Variable layer - keyed stores, priority-ordered scopes, interpolation

mod manager;
mod render;
mod scope;
mod store;

pub use manager::VarManager;
pub use render::Renderer;
pub use scope::{Scope, ScopeKind};
pub use store::VarStore;

use serde_yaml::Value;

/// Render a variable value as the string form used in interpolated arguments.
///
/// Scalars print bare; null prints empty; lists and maps fall back to their
/// YAML representation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}
