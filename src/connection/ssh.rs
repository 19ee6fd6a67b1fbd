// SSH transport backed by ssh2

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{CheckResult, KnownHostFileKind, Session};

use super::{Connection, ConnectionKind, ExecResult};
use crate::output::ArmadaError;

/// Resolved authentication material for one dial
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub key_passphrase: Option<String>,
    pub use_key_auth: bool,
}

impl SshAuth {
    /// Whether any usable auth method is present
    pub fn is_available(&self) -> bool {
        if self.use_key_auth {
            self.key_file.is_some()
        } else {
            self.password.is_some()
        }
    }
}

/// One SSH connection to a host.
///
/// ssh2 calls are blocking; each command opens a fresh session channel,
/// drains stdout and stderr fully, then waits for the exit status. File
/// transfer goes over SFTP.
pub struct SshConnection {
    host: String,
    port: u16,
    auth: SshAuth,
    connect_timeout: Duration,
    verify_host_key: bool,
    session: Mutex<Option<Session>>,
}

impl SshConnection {
    pub fn new(host: impl Into<String>, port: u16, auth: SshAuth) -> Self {
        SshConnection {
            host: host.into(),
            port,
            auth,
            connect_timeout: Duration::from_secs(10),
            verify_host_key: true,
            session: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_host_key_verification(mut self, verify: bool) -> Self {
        self.verify_host_key = verify;
        self
    }

    fn conn_err(&self, message: impl Into<String>, retryable: bool) -> ArmadaError {
        ArmadaError::Connection {
            host: self.host.clone(),
            message: message.into(),
            retryable,
            suggestion: None,
        }
    }

    fn dial(&self) -> Result<Session, ArmadaError> {
        if !self.auth.is_available() {
            return Err(ArmadaError::Connection {
                host: self.host.clone(),
                message: "no authentication method available".to_string(),
                retryable: false,
                suggestion: Some(
                    "configure ssh.password, or ssh.key_file with use_key_auth".to_string(),
                ),
            });
        }

        let addr = format!("{}:{}", self.host, self.port);
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|e| self.conn_err(format!("invalid address {}: {}", addr, e), false))?
            .next()
            .ok_or_else(|| self.conn_err(format!("address {} did not resolve", addr), false))?;

        let tcp = TcpStream::connect_timeout(&sockaddr, self.connect_timeout)
            .map_err(|e| self.conn_err(format!("dial {} failed: {}", addr, e), true))?;

        let mut session = Session::new()
            .map_err(|e| self.conn_err(format!("session init failed: {}", e), true))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| self.conn_err(format!("handshake failed: {}", e), true))?;

        if self.verify_host_key {
            self.check_host_key(&session)?;
        }

        if self.auth.use_key_auth {
            let key = self
                .auth
                .key_file
                .as_deref()
                .ok_or_else(|| self.conn_err("key auth requested without a key file", false))?;
            session
                .userauth_pubkey_file(
                    &self.auth.user,
                    None,
                    key,
                    self.auth.key_passphrase.as_deref(),
                )
                .map_err(|e| ArmadaError::Connection {
                    host: self.host.clone(),
                    message: format!("key authentication failed: {}", e),
                    retryable: false,
                    suggestion: Some("check the key file path and passphrase".to_string()),
                })?;
        } else {
            let password = self
                .auth
                .password
                .as_deref()
                .ok_or_else(|| self.conn_err("password auth requested without a password", false))?;
            session
                .userauth_password(&self.auth.user, password)
                .map_err(|e| ArmadaError::Connection {
                    host: self.host.clone(),
                    message: format!("password authentication failed: {}", e),
                    retryable: false,
                    suggestion: Some("check ssh.user and ssh.password".to_string()),
                })?;
        }

        Ok(session)
    }

    /// Verify the server key against ~/.ssh/known_hosts. Unknown hosts are
    /// trusted on first use; a changed key is fatal.
    fn check_host_key(&self, session: &Session) -> Result<(), ArmadaError> {
        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| self.conn_err(format!("known-hosts init failed: {}", e), false))?;

        if let Some(home) = std::env::var_os("HOME") {
            let path = Path::new(&home).join(".ssh").join("known_hosts");
            // A missing file just means every host is new
            let _ = known_hosts.read_file(&path, KnownHostFileKind::OpenSSH);
        }

        let (key, _) = session
            .host_key()
            .ok_or_else(|| self.conn_err("server offered no host key", false))?;

        match known_hosts.check_port(&self.host, self.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound | CheckResult::Failure => Ok(()),
            CheckResult::Mismatch => Err(ArmadaError::Connection {
                host: self.host.clone(),
                message: "host key changed since it was last seen".to_string(),
                retryable: false,
                suggestion: Some(
                    "verify the host's identity, then update ~/.ssh/known_hosts".to_string(),
                ),
            }),
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn connect(&self) -> Result<(), ArmadaError> {
        let mut guard = self.session.lock();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.dial()?);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ArmadaError> {
        if let Some(session) = self.session.lock().take() {
            let _ = session.disconnect(None, "closing", None);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.authenticated())
            .unwrap_or(false)
    }

    async fn execute_command(&self, command: &str) -> Result<ExecResult, ArmadaError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| self.conn_err("not connected", true))?;

        let start = Instant::now();

        let mut channel = session
            .channel_session()
            .map_err(|e| self.conn_err(format!("failed to open channel: {}", e), true))?;
        channel
            .exec(command)
            .map_err(|e| self.conn_err(format!("failed to start command: {}", e), true))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| self.conn_err(format!("failed to read stdout: {}", e), true))?;

        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| self.conn_err(format!("failed to read stderr: {}", e), true))?;

        channel
            .wait_close()
            .map_err(|e| self.conn_err(format!("failed to wait for command: {}", e), true))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| self.conn_err(format!("failed to read exit status: {}", e), true))?;

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            duration: start.elapsed(),
        })
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError> {
        let content = std::fs::read(local).map_err(|e| ArmadaError::Io {
            message: format!("failed to read local file: {}", e),
            path: Some(local.to_path_buf()),
        })?;

        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| self.conn_err("not connected", true))?;

        let sftp = session
            .sftp()
            .map_err(|e| self.conn_err(format!("failed to open sftp: {}", e), true))?;
        let mut file = sftp
            .create(Path::new(remote))
            .map_err(|e| self.conn_err(format!("failed to create {}: {}", remote, e), true))?;
        file.write_all(&content)
            .map_err(|e| self.conn_err(format!("failed to write {}: {}", remote, e), true))?;

        Ok(())
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), ArmadaError> {
        let content = {
            let guard = self.session.lock();
            let session = guard
                .as_ref()
                .ok_or_else(|| self.conn_err("not connected", true))?;

            let sftp = session
                .sftp()
                .map_err(|e| self.conn_err(format!("failed to open sftp: {}", e), true))?;
            let mut file = sftp
                .open(Path::new(remote))
                .map_err(|e| self.conn_err(format!("failed to open {}: {}", remote, e), true))?;

            let mut content = Vec::new();
            file.read_to_end(&mut content)
                .map_err(|e| self.conn_err(format!("failed to read {}: {}", remote, e), true))?;
            content
        };

        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ArmadaError::Io {
                    message: format!("failed to create directory: {}", e),
                    path: Some(parent.to_path_buf()),
                })?;
            }
        }

        std::fs::write(local, content).map_err(|e| ArmadaError::Io {
            message: format!("failed to write local file: {}", e),
            path: Some(local.to_path_buf()),
        })
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ssh
    }

    fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_availability() {
        let mut auth = SshAuth {
            user: "deploy".to_string(),
            ..Default::default()
        };
        assert!(!auth.is_available());

        auth.password = Some("secret".to_string());
        assert!(auth.is_available());

        // Key auth requested but no key file present
        auth.use_key_auth = true;
        assert!(!auth.is_available());

        auth.key_file = Some(PathBuf::from("/home/deploy/.ssh/id_ed25519"));
        assert!(auth.is_available());
    }

    #[tokio::test]
    async fn test_dial_without_auth_is_auth_missing() {
        let conn = SshConnection::new("192.0.2.1", 22, SshAuth::default());
        let err = conn.connect().await.unwrap_err();
        assert!(err.to_string().contains("no authentication method"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let auth = SshAuth {
            user: "deploy".to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let conn = SshConnection::new("192.0.2.1", 22, auth);
        assert!(!conn.is_connected());

        let err = conn.execute_command("true").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
