// template module - render a local template and deploy it

use std::io::Write;

use async_trait::async_trait;

use super::{mode_arg, required_str, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::{ArmadaError, ModuleError};
use crate::task::{Task, TaskResult};

/// Reads `src` locally, renders it over the variable stack, stages the
/// result in a temporary file and copies that to `dest`. The staging file
/// is removed on every exit path.
pub struct TemplateModule;

#[async_trait]
impl Module for TemplateModule {
    fn name(&self) -> &'static str {
        "template"
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

        let content = tokio::fs::read_to_string(&src)
            .await
            .map_err(|e| ArmadaError::Io {
                message: format!("failed to read template: {}", e),
                path: Some(src.clone().into()),
            })?;

        let rendered = ctx
            .renderer
            .render_string(&content, Some(&ctx.overlay(task)))?;

        // Staged locally so the transfer is a plain byte-exact copy; the
        // NamedTempFile guard deletes it however this function returns.
        let mut staged = tempfile::NamedTempFile::new().map_err(|e| ArmadaError::Io {
            message: format!("failed to create staging file: {}", e),
            path: None,
        })?;
        staged
            .write_all(rendered.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| ArmadaError::Io {
                message: format!("failed to write staging file: {}", e),
                path: Some(staged.path().to_path_buf()),
            })?;

        conn.copy_file(staged.path(), &dest).await?;

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
            .with_stdout(format!("deployed template {} to {}", src, dest))
            .with_extra("src", src)
            .with_extra("dest", dest))
    }
}
