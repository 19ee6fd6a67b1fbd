// Built-in modules and the dispatch registry

mod command;
mod copy;
mod fetch;
mod file;
mod import_tasks;
mod shell;
mod template;

pub use command::CommandModule;
pub use copy::CopyModule;
pub use fetch::FetchModule;
pub use file::FileModule;
pub use import_tasks::ImportModule;
pub use shell::ShellModule;
pub use template::TemplateModule;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_yaml::{Mapping, Value};

use crate::connection::Connection;
use crate::output::{ArmadaError, ModuleError};
use crate::task::{Task, TaskResult};
use crate::vars::{Renderer, VarStore};

/// Shared services handed to every module invocation
pub struct ModuleContext {
    pub vars: Arc<VarStore>,
    pub renderer: Arc<Renderer>,
}

impl ModuleContext {
    pub fn new(vars: Arc<VarStore>, renderer: Arc<Renderer>) -> Self {
        ModuleContext { vars, renderer }
    }

    /// The per-invocation variable overlay: task vars over the run's store
    pub fn overlay(&self, task: &Task) -> HashMap<String, Value> {
        let mut extra = self.vars.get_all();
        extra.extend(task.vars.clone());
        extra
    }

    /// Render the spec's arguments immediately before execution. The
    /// rendered mapping is a local value and is never written back into
    /// the spec.
    pub fn render_args(&self, task: &Task) -> Result<Mapping, ArmadaError> {
        let extra = self.overlay(task);
        let rendered = self
            .renderer
            .render_value(&Value::Mapping(task.spec.args.clone()), Some(&extra))?;
        match rendered {
            Value::Mapping(map) => Ok(map),
            _ => Ok(Mapping::new()),
        }
    }
}

/// A named capability invoked by tasks
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError>;
}

/// Dispatch table from module name to implementation
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with every built-in module
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(CommandModule));
        registry.register(Arc::new(ShellModule));
        registry.register(Arc::new(FileModule));
        registry.register(Arc::new(CopyModule));
        registry.register(Arc::new(FetchModule));
        registry.register(Arc::new(TemplateModule));
        registry.register(Arc::new(ImportModule));
        registry
    }

    pub fn register(&self, module: Arc<dyn Module>) {
        self.modules
            .write()
            .insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn contract_error(module: &str, task: &Task, message: String) -> ArmadaError {
    ArmadaError::Module(Box::new(ModuleError {
        module: module.to_string(),
        task_id: task.id.clone(),
        host: task.host.clone(),
        message,
        stderr: None,
        suggestion: None,
    }))
}

/// Fetch a required string argument; missing or non-string is a contract
/// error.
pub(crate) fn required_str(
    args: &Mapping,
    module: &str,
    task: &Task,
    key: &str,
) -> Result<String, ArmadaError> {
    match args.get(key) {
        None => Err(contract_error(
            module,
            task,
            format!("missing required argument '{}'", key),
        )),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(contract_error(
            module,
            task,
            format!("argument '{}' must be a string", key),
        )),
    }
}

pub(crate) fn optional_str(
    args: &Mapping,
    module: &str,
    task: &Task,
    key: &str,
) -> Result<Option<String>, ArmadaError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(contract_error(
            module,
            task,
            format!("argument '{}' must be a string", key),
        )),
    }
}

pub(crate) fn optional_bool(
    args: &Mapping,
    module: &str,
    task: &Task,
    key: &str,
) -> Result<Option<bool>, ArmadaError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(contract_error(
            module,
            task,
            format!("argument '{}' must be a boolean", key),
        )),
    }
}

/// The `mode` argument accepts a string ("0644") or an octal-rendered int
pub(crate) fn mode_arg(
    args: &Mapping,
    module: &str,
    task: &Task,
) -> Result<Option<String>, ArmadaError> {
    match args.get("mode") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(Some(format!("{:o}", v))),
            None => Err(contract_error(
                module,
                task,
                "argument 'mode' must be a string or octal integer".to_string(),
            )),
        },
        Some(_) => Err(contract_error(
            module,
            task,
            "argument 'mode' must be a string or octal integer".to_string(),
        )),
    }
}

/// Build the standard result for a command-style execution
pub(crate) fn result_from_exec(result: crate::connection::ExecResult) -> TaskResult {
    TaskResult {
        exit_code: result.exit_code,
        changed: result.exit_code == 0 && (!result.stdout.is_empty() || !result.stderr.is_empty()),
        failed: result.exit_code != 0,
        duration: result.duration,
        stdout: result.stdout,
        stderr: result.stderr,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    // Shared test double: a scripted in-memory connection

    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::connection::{Connection, ConnectionKind, ExecResult};
    use crate::output::ArmadaError;
    use crate::playbook::TaskSpec;
    use crate::task::Task;
    use crate::vars::{Renderer, VarManager, VarStore};

    use super::ModuleContext;

    #[derive(Default)]
    pub struct Recorded {
        pub commands: Vec<String>,
        pub copies: Vec<(PathBuf, String)>,
        pub fetches: Vec<(String, PathBuf)>,
    }

    pub struct ScriptedConnection {
        pub host: String,
        pub recorded: Mutex<Recorded>,
        /// Exit codes handed out per command, in order; empty means 0
        pub exit_codes: Mutex<Vec<i32>>,
        pub stdout: String,
    }

    impl ScriptedConnection {
        pub fn new() -> Self {
            ScriptedConnection {
                host: "web1".to_string(),
                recorded: Mutex::new(Recorded::default()),
                exit_codes: Mutex::new(Vec::new()),
                stdout: String::new(),
            }
        }

        pub fn with_stdout(mut self, stdout: &str) -> Self {
            self.stdout = stdout.to_string();
            self
        }

        pub fn with_exit_codes(self, codes: &[i32]) -> Self {
            *self.exit_codes.lock() = codes.to_vec();
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.recorded.lock().commands.clone()
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn connect(&self) -> Result<(), ArmadaError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ArmadaError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn execute_command(&self, command: &str) -> Result<ExecResult, ArmadaError> {
            self.recorded.lock().commands.push(command.to_string());
            let mut codes = self.exit_codes.lock();
            let exit_code = if codes.is_empty() { 0 } else { codes.remove(0) };
            Ok(ExecResult {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code,
                duration: std::time::Duration::from_millis(1),
            })
        }

        async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError> {
            self.recorded
                .lock()
                .copies
                .push((local.to_path_buf(), remote.to_string()));
            Ok(())
        }

        async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), ArmadaError> {
            self.recorded
                .lock()
                .fetches
                .push((remote.to_string(), local.to_path_buf()));
            Ok(())
        }

        fn kind(&self) -> ConnectionKind {
            ConnectionKind::Ssh
        }

        fn host(&self) -> &str {
            &self.host
        }
    }

    pub fn context() -> ModuleContext {
        let manager = Arc::new(VarManager::new());
        ModuleContext::new(Arc::new(VarStore::new()), Arc::new(Renderer::new(manager)))
    }

    pub fn task_with(module: &str, args: &[(&str, serde_yaml::Value)]) -> Task {
        let mut spec = TaskSpec::new(module);
        for (k, v) in args {
            spec = spec.with_arg(k, v.clone());
        }
        Task::new(format!("{}@web1", module), Arc::new(spec), "web1")
    }
}
