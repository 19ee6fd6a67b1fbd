// shell module - run a script through an explicit shell

use async_trait::async_trait;

use super::{optional_str, required_str, result_from_exec, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::ArmadaError;
use crate::task::{Task, TaskResult};

const DEFAULT_SHELL: &str = "/bin/sh";

/// Wraps `script` in `<shell> -c '...'`, requoting embedded single quotes
/// so the script survives the outer quoting.
pub struct ShellModule;

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError> {
        let args = ctx.render_args(task)?;
        let script = required_str(&args, self.name(), task, "script")?;
        let shell = optional_str(&args, self.name(), task, "shell")?
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let cmd = format!("{} -c '{}'", shell, escape_single_quotes(&script));
        let exec = conn.execute_command(&cmd).await?;

        Ok(result_from_exec(exec)
            .with_extra("shell", shell)
            .with_extra("script", script))
    }
}

/// Requote `'` as `'\''` for embedding inside single quotes
fn escape_single_quotes(script: &str) -> String {
    script.replace('\'', "'\\''")
}
