// command module - run a single command on the target

use async_trait::async_trait;

use super::{required_str, result_from_exec, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::ArmadaError;
use crate::task::{Task, TaskResult};

/// Runs `cmd` verbatim over the connection. A non-zero exit marks the
/// result failed; any captured output on a clean exit marks it changed.
pub struct CommandModule;

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(
        &self,
        ctx: &ModuleContext,
        task: &Task,
        conn: &dyn Connection,
    ) -> Result<TaskResult, ArmadaError> {
        let args = ctx.render_args(task)?;
        let cmd = required_str(&args, self.name(), task, "cmd")?;

        let exec = conn.execute_command(&cmd).await?;
        Ok(result_from_exec(exec).with_extra("command", cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::{context, task_with, ScriptedConnection};
    use serde_yaml::Value;

    #[tokio::test]
    async fn test_runs_rendered_command() {
        let ctx = context();
        ctx.vars.set("target", Value::String("disk".into()));
        let conn = ScriptedConnection::new().with_stdout("ok\n");
        let task = task_with("command", &[("cmd", Value::String("check {{target}}".into()))]);

        let result = CommandModule.execute(&ctx, &task, &conn).await.unwrap();

        assert_eq!(conn.commands(), vec!["check disk"]);
        assert!(!result.failed);
        assert!(result.changed);
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.extra.get("command").unwrap(), "check disk");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_without_error() {
        let ctx = context();
        let conn = ScriptedConnection::new().with_exit_codes(&[2]);
        let task = task_with("command", &[("cmd", Value::String("false".into()))]);

        let result = CommandModule.execute(&ctx, &task, &conn).await.unwrap();
        assert!(result.failed);
        assert_eq!(result.exit_code, 2);
        assert!(!result.changed);
    }

    #[tokio::test]
    async fn test_silent_success_is_unchanged() {
        let ctx = context();
        let conn = ScriptedConnection::new();
        let task = task_with("command", &[("cmd", Value::String("true".into()))]);

        let result = CommandModule.execute(&ctx, &task, &conn).await.unwrap();
        assert!(!result.failed);
        assert!(!result.changed);
    }

    #[tokio::test]
    async fn test_missing_cmd_is_contract_error() {
        let ctx = context();
        let conn = ScriptedConnection::new();
        let task = task_with("command", &[]);

        let err = CommandModule.execute(&ctx, &task, &conn).await.unwrap_err();
        assert!(err.to_string().contains("missing required argument 'cmd'"));
        assert!(!err.is_retryable());
    }
}
