// Runtime task records and results

pub mod queue;

pub use queue::TaskQueue;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_yaml::Value;

use crate::playbook::TaskSpec;

/// Task lifecycle states; `pending -> running -> {success, failed, skipped,
/// cancelled}`, terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority; higher pops first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// One scheduled invocation of a module on one host
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique queue id, composed as `<taskname>@<host>`
    pub id: String,
    pub spec: Arc<TaskSpec>,
    pub host: String,
    /// Per-task variable overlay
    pub vars: HashMap<String, Value>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    /// Playbook file this task came from; import resolves relative paths
    /// against its directory
    pub source_file: PathBuf,
    /// How many imports deep this task sits
    pub import_depth: u32,
    /// Canonical playbook paths already on the import chain
    pub import_chain: Vec<PathBuf>,
}

impl Task {
    pub fn new(id: impl Into<String>, spec: Arc<TaskSpec>, host: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            spec,
            host: host.into(),
            vars: HashMap::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            depends_on: Vec::new(),
            retry_count: 0,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            source_file: PathBuf::new(),
            import_depth: 0,
            import_chain: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_source_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_file = path.into();
        self
    }

    /// Compose the queue id for a (task name, host) pair
    pub fn compose_id(name: &str, host: &str) -> String {
        format!("{}@{}", name, host)
    }
}

/// Structured outcome of one module execution
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub changed: bool,
    pub failed: bool,
    pub skipped: bool,
    pub unreachable: bool,
    pub timed_out: bool,
    pub duration: Duration,
    pub extra: HashMap<String, String>,
    /// Sub-task specs produced by the import module, enqueued by the engine
    pub imported_tasks: Vec<(String, TaskSpec)>,
}

impl TaskResult {
    pub fn success() -> Self {
        TaskResult::default()
    }

    pub fn changed() -> Self {
        TaskResult {
            changed: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        TaskResult {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}
