// Armada - declarative remote execution over SSH
//
// A playbook describes host groups, variables and an ordered list of tasks;
// the engine fans the tasks out over pooled SSH connections with bounded
// parallelism, per-task timeout/retry and dependency-aware scheduling.

pub mod config;
pub mod connection;
pub mod engine;
pub mod modules;
pub mod output;
pub mod playbook;
pub mod task;
pub mod vars;

pub use config::{Config, HostInfo, SshConfig};
pub use connection::{Connection, ConnectionKind, ConnectionManager, ExecResult};
pub use engine::{Engine, ExecutionOptions, PlaybookRunner, RunRecap};
pub use output::{ArmadaError, Logger};
pub use playbook::{TaskConfig, TaskSpec};
pub use task::{Task, TaskQueue, TaskResult, TaskStatus};
pub use vars::{Renderer, Scope, ScopeKind, VarManager, VarStore};

/// Version of the Armada tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, HostInfo, SshConfig};
    pub use crate::connection::{Connection, ConnectionManager};
    pub use crate::engine::{Engine, ExecutionOptions, PlaybookRunner};
    pub use crate::output::{ArmadaError, Logger};
    pub use crate::playbook::{TaskConfig, TaskSpec};
    pub use crate::task::{Task, TaskResult, TaskStatus};
    pub use crate::vars::{Renderer, VarManager, VarStore};
}
