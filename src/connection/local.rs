// Local command execution without SSH

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Connection, ConnectionKind, ExecResult};
use crate::output::ArmadaError;

/// Runs commands on the local machine via `sh -c`.
///
/// File transfer has no meaning for a local transport; both directions
/// return an unsupported-operation error.
pub struct LocalConnection {
    host: String,
    connected: AtomicBool,
}

impl LocalConnection {
    pub fn new(host: impl Into<String>) -> Self {
        LocalConnection {
            host: host.into(),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn connect(&self) -> Result<(), ArmadaError> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ArmadaError> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn execute_command(&self, command: &str) -> Result<ExecResult, ArmadaError> {
        let start = Instant::now();

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ArmadaError::Connection {
                host: self.host.clone(),
                message: format!("failed to spawn local command: {}", e),
                retryable: false,
                suggestion: Some("check that 'sh' is available on the system".to_string()),
            })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    async fn copy_file(&self, _local: &Path, _remote: &str) -> Result<(), ArmadaError> {
        Err(ArmadaError::Connection {
            host: self.host.clone(),
            message: "local transport does not support copy_file".to_string(),
            retryable: false,
            suggestion: None,
        })
    }

    async fn fetch_file(&self, _remote: &str, _local: &Path) -> Result<(), ArmadaError> {
        Err(ArmadaError::Connection {
            host: self.host.clone(),
            message: "local transport does not support fetch_file".to_string(),
            retryable: false,
            suggestion: None,
        })
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Local
    }

    fn host(&self) -> &str {
        &self.host
    }
}
