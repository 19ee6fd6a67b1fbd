// copy module - push a local file to the target

use std::path::Path;

use async_trait::async_trait;

use super::{mode_arg, required_str, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::{ArmadaError, ModuleError};
use crate::task::{Task, TaskResult};

/// Transfers `src` (local) to `dest` (remote) byte-exact, then applies an
/// optional mode.
pub struct CopyModule;

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError> {
        let args = ctx.render_args(task)?;
        let src = required_str(&args, self.name(), task, "src")?;
        let dest = required_str(&args, self.name(), task, "dest")?;

        conn.copy_file(Path::new(&src), &dest).await?;

        if let Some(mode) = mode_arg(&args, self.name(), task)? {
            let chmod = conn
                .execute_command(&format!("chmod {} {}", mode, dest))
                .await?;
            if !chmod.success() {
                return Err(ArmadaError::Module(Box::new(ModuleError {
                    module: self.name().to_string(),
                    task_id: task.id.clone(),
                    host: task.host.clone(),
                    message: format!("failed to set mode {} on {}", mode, dest),
                    stderr: Some(chmod.stderr),
                    suggestion: None,
                })));
            }
        }

        Ok(TaskResult::changed()
            .with_stdout(format!("copied {} to {}", src, dest))
            .with_extra("src", src)
            .with_extra("dest", dest))
    }
}
