// import module - splice another playbook's tasks into the run

use std::path::PathBuf;

use async_trait::async_trait;

use super::{required_str, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::{ArmadaError, ModuleError};
use crate::playbook::TaskConfig;
use crate::task::{Task, TaskResult};

/// Maximum nesting of imports before the chain is refused
pub const MAX_IMPORT_DEPTH: u32 = 16;

/// Loads the referenced playbook and returns its task list in the result.
/// Scheduling stays with the engine; this module never touches the queue.
///
/// `file` resolves relative to the directory of the playbook the task came
/// from. Re-importing a file already on the chain, or nesting deeper than
/// `MAX_IMPORT_DEPTH`, fails the task and enqueues nothing.
pub struct ImportModule;

#[async_trait]
impl Module for ImportModule {
    fn name(&self) -> &'static str {
        "import"
    }

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        _conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError> {
        let args = ctx.render_args(task)?;
        let file = required_str(&args, self.name(), task, "file")?;

        if task.import_depth >= MAX_IMPORT_DEPTH {
            return Err(self.refuse(
                task,
                format!("import depth exceeds {}", MAX_IMPORT_DEPTH),
            ));
        }

        let base = task
            .source_file
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        let resolved = base.join(&file);
        let canonical = resolved.canonicalize().map_err(|e| ArmadaError::Io {
            message: format!("import target not found: {}", e),
            path: Some(resolved.clone()),
        })?;

        if task.import_chain.contains(&canonical) {
            return Err(self.refuse(
                task,
                format!("import cycle through {}", canonical.display()),
            ));
        }

        let imported = TaskConfig::load(&canonical)?;
        let specs: Vec<(String, crate::playbook::TaskSpec)> = imported
            .task_entries()
            .map(|(id, spec)| (id.clone(), spec.clone()))
            .collect();
        let count = specs.len();

        Ok(TaskResult {
            changed: true,
            stdout: format!("imported {} task(s) from {}", count, file),
            imported_tasks: specs,
            ..Default::default()
        }
        .with_extra("file", file)
        .with_extra("imported_from", canonical.display().to_string()))
    }
}

impl ImportModule {
    fn refuse(&self, task: &Task, message: String) -> ArmadaError {
        ArmadaError::Module(Box::new(ModuleError {
            module: self.name().to_string(),
            task_id: task.id.clone(),
            host: task.host.clone(),
            message,
            stderr: None,
            suggestion: None,
        }))
    }
}
