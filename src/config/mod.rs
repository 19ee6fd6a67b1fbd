// Project configuration - SSH defaults, inventory, global vars

pub mod checker;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::connection::ConnectionKind;
use crate::output::{ArmadaError, ParseError, ParseErrorKind};

const DEFAULT_PORT: u16 = 22;

/// A single host record in the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname or IP address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional display alias
    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub connection_type: ConnectionKind,

    /// Host-specific variables
    #[serde(default)]
    pub vars: HashMap<String, Value>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl HostInfo {
    pub fn new(host: impl Into<String>) -> Self {
        HostInfo {
            host: host.into(),
            port: DEFAULT_PORT,
            alias: None,
            connection_type: ConnectionKind::default(),
            vars: HashMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.connection_type = kind;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }
}

/// An inventory entry is either a bare address string or a full mapping;
/// `"1.2.3.4"` is sugar for `{host: "1.2.3.4", port: 22, connection_type: ssh}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HostEntry {
    Address(String),
    Full(HostInfo),
}

impl From<HostEntry> for HostInfo {
    fn from(entry: HostEntry) -> Self {
        match entry {
            HostEntry::Address(addr) => HostInfo::new(addr),
            HostEntry::Full(info) => info,
        }
    }
}

/// SSH connection defaults applied when a host omits credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub password: String,
    pub key_file: String,
    pub key_password: String,
    pub port: u16,
    /// Connect timeout in seconds
    pub timeout: u64,
    /// Prefer key auth over password auth
    pub use_key_auth: bool,
    pub disable_host_key_checking: bool,
    pub use_jump_host: bool,
    pub jump_host: Option<JumpHostConfig>,
    pub max_parallel: i64,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: String::new(),
            password: String::new(),
            key_file: String::new(),
            key_password: String::new(),
            port: DEFAULT_PORT,
            timeout: 10,
            use_key_auth: false,
            disable_host_key_checking: false,
            use_jump_host: false,
            jump_host: None,
            max_parallel: 10,
        }
    }
}

impl SshConfig {
    /// `max_parallel <= 0` is treated as 1
    pub fn effective_max_parallel(&self) -> usize {
        if self.max_parallel <= 0 {
            1
        } else {
            self.max_parallel as usize
        }
    }
}

/// Jump-host block for proxied dials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpHostConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub key_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    ssh: SshConfig,
    hosts: HashMap<String, Vec<HostEntry>>,
    vars: HashMap<String, Value>,
}

/// One field-level validation finding
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Top-level project configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub ssh: SshConfig,
    /// group name -> ordered host list
    pub inventory: HashMap<String, Vec<HostInfo>>,
    pub vars: HashMap<String, Value>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ArmadaError> {
        let content = std::fs::read_to_string(path).map_err(|e| ArmadaError::Io {
            message: format!("failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::parse(&content).map_err(|err| match err {
            ArmadaError::Parse(mut parse) => {
                parse.file = Some(path.display().to_string());
                ArmadaError::Parse(parse)
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ArmadaError> {
        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| {
            ArmadaError::Parse(Box::new(ParseError {
                kind: ParseErrorKind::InvalidYaml,
                message: format!("invalid config YAML: {}", e),
                file: None,
                suggestion: None,
            }))
        })?;

        let mut config = Config {
            ssh: raw.ssh,
            inventory: raw
                .hosts
                .into_iter()
                .map(|(group, entries)| {
                    (group, entries.into_iter().map(HostInfo::from).collect())
                })
                .collect(),
            vars: raw.vars,
        };

        // A configured key with no password implies key auth
        if !config.ssh.use_key_auth
            && config.ssh.password.is_empty()
            && !config.ssh.key_file.is_empty()
        {
            config.ssh.use_key_auth = true;
        }

        let issues = config.validate();
        if !issues.is_empty() {
            let mut lines: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
            lines.sort();
            return Err(ArmadaError::parse(
                ParseErrorKind::InvalidValue,
                lines.join("; "),
            ));
        }

        Ok(config)
    }

    /// Field-level validation, one issue per finding
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (group, hosts) in &self.inventory {
            if group.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: "hosts".to_string(),
                    message: "group name must not be empty".to_string(),
                });
            }

            for (i, host) in hosts.iter().enumerate() {
                if host.host.trim().is_empty() {
                    issues.push(ValidationIssue {
                        field: format!("hosts.{}[{}].host", group, i),
                        message: "host address must not be empty".to_string(),
                    });
                }
                if host.port == 0 {
                    issues.push(ValidationIssue {
                        field: format!("hosts.{}[{}].port", group, i),
                        message: "port must be within 1..65535".to_string(),
                    });
                }
            }
        }

        if self.ssh.use_key_auth && self.ssh.key_file.is_empty() {
            issues.push(ValidationIssue {
                field: "ssh.key_file".to_string(),
                message: "key auth requires a key file path".to_string(),
            });
        }

        for key in self.vars.keys() {
            if key.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: "vars".to_string(),
                    message: "variable name must not be empty".to_string(),
                });
            }
        }

        issues
    }

    /// Hosts of one group, in declaration order
    pub fn group_hosts(&self, group: &str) -> Option<&[HostInfo]> {
        self.inventory.get(group).map(|hosts| hosts.as_slice())
    }

    /// Union of every group, de-duplicated by address
    pub fn all_hosts(&self) -> Vec<HostInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut groups: Vec<&String> = self.inventory.keys().collect();
        groups.sort();

        let mut hosts = Vec::new();
        for group in groups {
            for host in &self.inventory[group] {
                if seen.insert(host.host.clone()) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    /// Look up a host record by address across every group
    pub fn find_host(&self, address: &str) -> Option<&HostInfo> {
        self.inventory
            .values()
            .flat_map(|hosts| hosts.iter())
            .find(|h| h.host == address || h.alias.as_deref() == Some(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_sugar_expands_to_defaults() {
        let config = Config::parse(
            r#"
hosts:
  web: ["10.0.0.1", {host: 10.0.0.2, port: 2222, connection_type: local}]
"#,
        )
        .unwrap();

        let web = config.group_hosts("web").unwrap();
        assert_eq!(web[0].host, "10.0.0.1");
        assert_eq!(web[0].port, 22);
        assert_eq!(web[0].connection_type, ConnectionKind::Ssh);
        assert_eq!(web[1].port, 2222);
        assert_eq!(web[1].connection_type, ConnectionKind::Local);
    }

    #[test]
    fn test_port_zero_is_rejected() {
        let err = Config::parse(
            r#"
hosts:
  web: [{host: 10.0.0.1, port: 0}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("1..65535"));
    }

    #[test]
    fn test_key_file_implies_key_auth() {
        let config = Config::parse(
            r#"
ssh:
  user: deploy
  key_file: /home/deploy/.ssh/id_ed25519
"#,
        )
        .unwrap();
        assert!(config.ssh.use_key_auth);
    }

    #[test]
    fn test_key_auth_without_key_file_is_invalid() {
        let err = Config::parse(
            r#"
ssh:
  user: deploy
  use_key_auth: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("key file"));
    }

    #[test]
    fn test_max_parallel_floor() {
        let mut ssh = SshConfig::default();
        ssh.max_parallel = 0;
        assert_eq!(ssh.effective_max_parallel(), 1);
        ssh.max_parallel = -3;
        assert_eq!(ssh.effective_max_parallel(), 1);
        ssh.max_parallel = 16;
        assert_eq!(ssh.effective_max_parallel(), 16);
    }

    #[test]
    fn test_all_hosts_deduplicates_by_address() {
        let config = Config::parse(
            r#"
hosts:
  web: ["10.0.0.1", "10.0.0.2"]
  db: ["10.0.0.2", "10.0.0.3"]
"#,
        )
        .unwrap();

        let mut all: Vec<String> = config.all_hosts().into_iter().map(|h| h.host).collect();
        all.sort();
        assert_eq!(all, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_host_vars_parse() {
        let config = Config::parse(
            r#"
hosts:
  web:
    - host: 10.0.0.1
      alias: web1
      vars:
        role: frontend
vars:
  app_name: foo
"#,
        )
        .unwrap();

        let host = config.find_host("web1").unwrap();
        assert_eq!(host.vars.get("role"), Some(&Value::String("frontend".into())));
        assert_eq!(
            config.vars.get("app_name"),
            Some(&Value::String("foo".into()))
        );
    }
}
