// Connection layer - command/file transport over SSH or local shells

mod backoff;
mod local;
mod pool;
mod ssh;

pub use backoff::{calculate_delay, DelayStrategy};
pub use local::LocalConnection;
pub use pool::{ConnectionManager, ConnectionPool, PoolKey};
pub use ssh::SshConnection;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::output::ArmadaError;

/// Transport kind for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Ssh,
    Local,
    Winrm,
    Docker,
}

impl Default for ConnectionKind {
    fn default() -> Self {
        ConnectionKind::Ssh
    }
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Ssh => "ssh",
            ConnectionKind::Local => "local",
            ConnectionKind::Winrm => "winrm",
            ConnectionKind::Docker => "docker",
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing one command over a transport.
///
/// A non-zero exit code is data, not an error; transport failures surface
/// as `ArmadaError` instead.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstract command/file transport.
///
/// Connect/disconnect are idempotent. File transfers are byte-exact; a
/// missing source is an error and the destination is truncated or created.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<(), ArmadaError>;

    async fn disconnect(&self) -> Result<(), ArmadaError>;

    fn is_connected(&self) -> bool;

    async fn execute_command(&self, command: &str) -> Result<ExecResult, ArmadaError>;

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError>;

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), ArmadaError>;

    fn kind(&self) -> ConnectionKind;

    /// Host this connection targets, for reporting
    fn host(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let kind: ConnectionKind = serde_yaml::from_str("ssh").unwrap();
        assert_eq!(kind, ConnectionKind::Ssh);
        let kind: ConnectionKind = serde_yaml::from_str("docker").unwrap();
        assert_eq!(kind, ConnectionKind::Docker);
        assert!(serde_yaml::from_str::<ConnectionKind>("telnet").is_err());
    }

    #[test]
    fn test_nonzero_exit_is_not_success() {
        let result = ExecResult {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!result.success());
    }
}
