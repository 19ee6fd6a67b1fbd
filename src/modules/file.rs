// file module - manage remote paths via one compound shell command

use async_trait::async_trait;

use super::{mode_arg, optional_str, required_str, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::{ArmadaError, ModuleError};
use crate::task::{Task, TaskResult};

/// Ensures a remote path matches the requested state, then chains
/// chmod/chown/chgrp as applicable. Everything ships as a single compound
/// command over the connection.
pub struct FileModule;

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError> {
        let args = ctx.render_args(task)?;
        let path = required_str(&args, self.name(), task, "path")?;
        let state = optional_str(&args, self.name(), task, "state")?
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "file".to_string());

        let mut cmd = match state.as_str() {
            "absent" => format!("rm -rf {}", path),
            "directory" => format!("mkdir -p {}", path),
            "touch" => format!("touch {}", path),
            "file" => format!("test -f {} || touch {}", path, path),
            other => {
                return Err(ArmadaError::Module(Box::new(ModuleError {
                    module: self.name().to_string(),
                    task_id: task.id.clone(),
                    host: task.host.clone(),
                    message: format!("unsupported state '{}'", other),
                    stderr: None,
                    suggestion: Some("use file, directory, touch or absent".to_string()),
                })))
            }
        };

        if let Some(mode) = mode_arg(&args, self.name(), task)? {
            cmd = format!("{} && chmod {} {}", cmd, mode, path);
        }
        if let Some(owner) = optional_str(&args, self.name(), task, "owner")?.filter(|s| !s.is_empty())
        {
            cmd = format!("{} && chown {} {}", cmd, owner, path);
        }
        if let Some(group) = optional_str(&args, self.name(), task, "group")?.filter(|s| !s.is_empty())
        {
            cmd = format!("{} && chgrp {} {}", cmd, group, path);
        }

        let exec = conn.execute_command(&cmd).await?;
        let failed = exec.exit_code != 0;

        Ok(TaskResult {
            exit_code: exec.exit_code,
            changed: !failed,
            failed,
            duration: exec.duration,
            stdout: exec.stdout,
            stderr: exec.stderr,
            ..Default::default()
        }
        .with_extra("path", path)
        .with_extra("state", state)
        .with_extra("command", cmd))
    }
}
