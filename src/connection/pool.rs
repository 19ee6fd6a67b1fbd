// Keyed connection pool with idle reaping

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::backoff::{calculate_delay, DelayStrategy};
use super::local::LocalConnection;
use super::ssh::{SshAuth, SshConnection};
use super::{Connection, ConnectionKind};
use crate::config::SshConfig;
use crate::output::ArmadaError;

/// Pool key: one entry per (host, port, user)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.user)
    }
}

struct PooledEntry {
    conn: Arc<dyn Connection>,
    last_used: Instant,
    in_use: bool,
}

/// Reference-counted connection cache.
///
/// An entry is either idle or checked out to exactly one worker; stale idle
/// entries are closed on lookup or by `reap_idle`. The map is guarded by a
/// single pool-wide lock which is never held across a dial.
pub struct ConnectionPool {
    entries: RwLock<HashMap<PoolKey, PooledEntry>>,
    max_idle: Duration,
    max_retries: u32,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            entries: RwLock::new(HashMap::new()),
            max_idle: Duration::from_secs(300),
            max_retries: 3,
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Check out a connection for `key`, reusing a fresh idle entry or
    /// dialing a new one via `connect` (retried with linear backoff).
    pub async fn get<F>(
        self: Arc<Self>,
        key: PoolKey,
        connect: F,
    ) -> Result<ConnectionHandle, ArmadaError>
    where
        F: Fn() -> Arc<dyn Connection>,
    {
        if let Some(conn) = self.checkout_idle(&key) {
            return Ok(ConnectionHandle {
                conn,
                key,
                pool: self,
            });
        }

        // Dial outside the pool lock
        let conn = connect();
        let schedule = DelayStrategy::dial();
        let mut attempt = 0;

        loop {
            match conn.connect().await {
                Ok(()) => break,
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    tokio::time::sleep(calculate_delay(&schedule, attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.entries.write().insert(
            key.clone(),
            PooledEntry {
                conn: conn.clone(),
                last_used: Instant::now(),
                in_use: true,
            },
        );

        Ok(ConnectionHandle {
            conn,
            key,
            pool: self,
        })
    }

    /// Take a matching idle entry if it is still fresh; drop it if stale
    fn checkout_idle(&self, key: &PoolKey) -> Option<Arc<dyn Connection>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        if entry.in_use {
            return None;
        }

        if entry.last_used.elapsed() > self.max_idle {
            entries.remove(key);
            return None;
        }

        entry.in_use = true;
        Some(entry.conn.clone())
    }

    fn release(&self, key: &PoolKey, conn: &Arc<dyn Connection>) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            // A replaced entry must not be marked idle by the old holder
            if Arc::ptr_eq(&entry.conn, conn) {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
    }

    /// Close and drop the entry for `key`
    pub async fn close(&self, key: &PoolKey) {
        let removed = self.entries.write().remove(key);
        if let Some(entry) = removed {
            let _ = entry.conn.disconnect().await;
        }
    }

    /// Close and drop every entry
    pub async fn close_all(&self) {
        let drained: Vec<PooledEntry> = {
            let mut entries = self.entries.write();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.conn.disconnect().await;
        }
    }

    /// Close idle entries older than `max_idle`
    pub async fn reap_idle(&self) {
        let stale: Vec<Arc<dyn Connection>> = {
            let mut entries = self.entries.write();
            let max_idle = self.max_idle;
            let keys: Vec<PoolKey> = entries
                .iter()
                .filter(|(_, e)| !e.in_use && e.last_used.elapsed() > max_idle)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| e.conn))
                .collect()
        };
        for conn in stale {
            let _ = conn.disconnect().await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped checkout: the entry returns to the pool when the handle drops,
/// whatever path the worker exits through.
pub struct ConnectionHandle {
    conn: Arc<dyn Connection>,
    key: PoolKey,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl ConnectionHandle {
    pub fn conn(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.pool.release(&self.key, &self.conn);
    }
}

/// Resolves transports and credentials for hosts, backed by the pool.
///
/// SSH defaults (user, password, key material) come from the project
/// `SshConfig` when the host record does not override them.
pub struct ConnectionManager {
    pool: Arc<ConnectionPool>,
    ssh: SshConfig,
}

impl ConnectionManager {
    pub fn new(ssh: SshConfig) -> Self {
        ConnectionManager {
            pool: Arc::new(ConnectionPool::new()),
            ssh,
        }
    }

    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Arc::new(pool);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Check out a connection to `host:port` over the given transport kind
    pub async fn get(
        &self,
        host: &str,
        port: u16,
        kind: ConnectionKind,
    ) -> Result<ConnectionHandle, ArmadaError> {
        match kind {
            ConnectionKind::Local => {
                let key = PoolKey {
                    host: host.to_string(),
                    port,
                    user: String::new(),
                };
                let host = host.to_string();
                self.pool.clone()
                    .get(key, move || {
                        Arc::new(LocalConnection::new(host.clone())) as Arc<dyn Connection>
                    })
                    .await
            }
            ConnectionKind::Ssh => {
                let auth = self.resolve_auth(host)?;
                let key = PoolKey {
                    host: host.to_string(),
                    port,
                    user: auth.user.clone(),
                };
                let host = host.to_string();
                let timeout = Duration::from_secs(self.ssh.timeout.max(1));
                let verify = !self.ssh.disable_host_key_checking;
                self.pool.clone()
                    .get(key, move || {
                        Arc::new(
                            SshConnection::new(host.clone(), port, auth.clone())
                                .with_connect_timeout(timeout)
                                .with_host_key_verification(verify),
                        ) as Arc<dyn Connection>
                    })
                    .await
            }
            other => Err(ArmadaError::Connection {
                host: host.to_string(),
                message: format!("connection kind {} is not supported", other),
                retryable: false,
                suggestion: Some("use 'ssh' or 'local'".to_string()),
            }),
        }
    }

    /// Assemble auth material from the SSH defaults
    fn resolve_auth(&self, host: &str) -> Result<SshAuth, ArmadaError> {
        let user = if self.ssh.user.is_empty() {
            std::env::var("USER").unwrap_or_else(|_| "root".to_string())
        } else {
            self.ssh.user.clone()
        };

        let auth = SshAuth {
            user,
            password: non_empty(&self.ssh.password),
            key_file: non_empty(&self.ssh.key_file).map(PathBuf::from),
            key_passphrase: non_empty(&self.ssh.key_password),
            use_key_auth: self.ssh.use_key_auth,
        };

        if !auth.is_available() {
            return Err(ArmadaError::Connection {
                host: host.to_string(),
                message: "no authentication method available".to_string(),
                retryable: false,
                suggestion: Some(
                    "configure ssh.password, or ssh.key_file with use_key_auth".to_string(),
                ),
            });
        }

        Ok(auth)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use crate::connection::ExecResult;

    struct FakeConnection {
        host: String,
        dials: Arc<AtomicUsize>,
        fail_dials: usize,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn connect(&self) -> Result<(), ArmadaError> {
            let attempt = self.dials.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_dials {
                return Err(ArmadaError::Connection {
                    host: self.host.clone(),
                    message: "dial refused".to_string(),
                    retryable: true,
                    suggestion: None,
                });
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ArmadaError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn execute_command(&self, _command: &str) -> Result<ExecResult, ArmadaError> {
            Ok(ExecResult::default())
        }

        async fn copy_file(&self, _local: &Path, _remote: &str) -> Result<(), ArmadaError> {
            Ok(())
        }

        async fn fetch_file(&self, _remote: &str, _local: &Path) -> Result<(), ArmadaError> {
            Ok(())
        }

        fn kind(&self) -> ConnectionKind {
            ConnectionKind::Ssh
        }

        fn host(&self) -> &str {
            &self.host
        }
    }

    fn key(host: &str) -> PoolKey {
        PoolKey {
            host: host.to_string(),
            port: 22,
            user: "deploy".to_string(),
        }
    }

    fn fake(dials: &Arc<AtomicUsize>, fail_dials: usize) -> impl Fn() -> Arc<dyn Connection> {
        let dials = dials.clone();
        move || {
            Arc::new(FakeConnection {
                host: "web1".to_string(),
                dials: dials.clone(),
                fail_dials,
            }) as Arc<dyn Connection>
        }
    }

    #[tokio::test]
    async fn test_checkout_and_reuse() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));

        let handle = pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap();
        assert_eq!(pool.len(), 1);
        drop(handle);

        // Second checkout reuses the idle entry without dialing again
        let _handle = pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_in_use_entry_is_not_shared() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));

        let first = pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap();
        let _second = pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap();

        // The key was re-dialed rather than handing out the busy entry
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 1);
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_retries_with_backoff() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));

        // Fails twice, succeeds on the third attempt
        let handle = pool.clone().get(key("web1"), fake(&dials, 2)).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 3);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_gives_up_after_max_retries() {
        let pool = Arc::new(ConnectionPool::new().with_max_retries(1));
        let dials = Arc::new(AtomicUsize::new(0));

        let err = pool.clone().get(key("web1"), fake(&dials, 10)).await.unwrap_err();
        assert!(err.to_string().contains("dial refused"));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_stale_idle_entry_is_replaced() {
        let pool = Arc::new(ConnectionPool::new().with_max_idle(Duration::from_secs(0)));
        let dials = Arc::new(AtomicUsize::new(0));

        drop(pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap());
        std::thread::sleep(Duration::from_millis(5));

        drop(pool.clone().get(key("web1"), fake(&dials, 0)).await.unwrap());
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reap_idle_drops_only_stale_idle() {
        let pool = Arc::new(ConnectionPool::new().with_max_idle(Duration::from_secs(0)));
        let dials = Arc::new(AtomicUsize::new(0));

        let busy = pool.clone().get(key("busy"), fake(&dials, 0)).await.unwrap();
        drop(pool.clone().get(key("idle"), fake(&dials, 0)).await.unwrap());
        std::thread::sleep(Duration::from_millis(5));

        pool.reap_idle().await;
        assert_eq!(pool.len(), 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_close_all() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));
        drop(pool.clone().get(key("a"), fake(&dials, 0)).await.unwrap());
        drop(pool.clone().get(key("b"), fake(&dials, 0)).await.unwrap());

        pool.close_all().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_manager_rejects_unsupported_kinds() {
        let manager = ConnectionManager::new(SshConfig::default());
        let err = manager
            .get("web1", 22, ConnectionKind::Winrm)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn test_manager_auth_missing() {
        // No password, no key file
        let manager = ConnectionManager::new(SshConfig::default());
        let err = manager
            .get("web1", 22, ConnectionKind::Ssh)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no authentication method"));
    }
}
