// fetch module - pull a remote file to the local machine

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{optional_bool, required_str, Module, ModuleContext};
use crate::connection::Connection;
use crate::output::ArmadaError;
use crate::task::{Task, TaskResult};

/// Transfers `src` (remote) to `dest` (local). With `flat: false` the
/// target becomes `dest/<host>/<src>` so multi-host fetches cannot
/// collide.
pub struct FetchModule;

#[async_trait]
impl Module for FetchModule {
    fn name(&self) -> &'static str {
        "fetch"
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
        let flat = optional_bool(&args, self.name(), task, "flat")?.unwrap_or(true);

        let target = if flat {
            PathBuf::from(&dest)
        } else {
            Path::new(&dest)
                .join(&task.host)
                .join(src.trim_start_matches('/'))
        };

        conn.fetch_file(&src, &target).await?;

        Ok(TaskResult::changed()
            .with_stdout(format!("fetched {} to {}", src, target.display()))
            .with_extra("src", src)
            .with_extra("dest", target.display().to_string()))
    }
}
