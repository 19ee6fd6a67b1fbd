// Playbook schema - task configs, task specs, handlers

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::ValidationIssue;
use crate::output::{ArmadaError, ParseError, ParseErrorKind};

/// One declarative task: a module invocation with free-form arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub module: String,
    /// Module-specific arguments, rendered immediately before execution
    pub args: serde_yaml::Mapping,
    /// Per-task variable overlay
    pub vars: HashMap<String, Value>,
    /// Skip the task unless this renders truthy
    pub when: Option<String>,
    pub notify: Vec<String>,
    pub ignore_error: bool,
    /// Per-task retry override; 0 falls back to the engine default
    pub retries: u32,
    /// Retry delay override: integer seconds or a "5s" / "500ms" string
    pub delay: Option<Value>,
    pub tags: Vec<String>,
}

impl TaskSpec {
    pub fn new(module: impl Into<String>) -> Self {
        TaskSpec {
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(Value::String(key.to_string()), value);
        self
    }

    /// Parse the delay override into a duration
    pub fn delay_duration(&self) -> Result<Option<Duration>, ArmadaError> {
        let Some(delay) = &self.delay else {
            return Ok(None);
        };

        match delay {
            Value::Number(n) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| bad_delay(delay)),
            Value::String(s) => parse_delay_str(s).map(Some).ok_or_else(|| bad_delay(delay)),
            _ => Err(bad_delay(delay)),
        }
    }

    /// Whether the task matches the requested tag set (empty filter matches all)
    pub fn matches_tags(&self, filter: &[String]) -> bool {
        filter.is_empty() || self.tags.iter().any(|t| filter.contains(t))
    }
}

fn bad_delay(value: &Value) -> ArmadaError {
    ArmadaError::parse(
        ParseErrorKind::InvalidValue,
        format!(
            "delay must be seconds or a duration string, got {:?}",
            value
        ),
    )
}

fn parse_delay_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// Named module invocation triggered by `notify` (schema only; execution is
/// a future extension)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSpec {
    pub name: String,
    pub module: String,
    pub args: serde_yaml::Mapping,
}

/// A playbook: host groups plus an ordered task list.
///
/// Each task list entry is a single-key mapping from task id to spec; ids
/// must be unique within the playbook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub name: String,
    pub description: Option<String>,
    pub hosts: Vec<String>,
    pub tasks: Vec<HashMap<String, TaskSpec>>,
    pub vars: HashMap<String, Value>,
    pub handlers: Vec<HandlerSpec>,
}

impl TaskConfig {
    pub fn load(path: &Path) -> Result<Self, ArmadaError> {
        let content = std::fs::read_to_string(path).map_err(|e| ArmadaError::Io {
            message: format!("failed to read playbook: {}", e),
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
        let config: TaskConfig = serde_yaml::from_str(content).map_err(|e| {
            ArmadaError::Parse(Box::new(ParseError {
                kind: ParseErrorKind::InvalidYaml,
                message: format!("invalid playbook YAML: {}", e),
                file: None,
                suggestion: None,
            }))
        })?;

        let issues = config.validate();
        if !issues.is_empty() {
            let lines: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
            return Err(ArmadaError::parse(
                ParseErrorKind::MissingField,
                lines.join("; "),
            ));
        }

        Ok(config)
    }

    /// Field-level validation, one issue per finding
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(issue("name", "playbook name must not be empty"));
        }
        if self.hosts.is_empty() {
            issues.push(issue("hosts", "playbook must target at least one group"));
        }
        if self.tasks.is_empty() {
            issues.push(issue("tasks", "playbook must contain at least one task"));
        }

        let mut seen_ids = HashSet::new();
        for (i, entry) in self.tasks.iter().enumerate() {
            if entry.len() != 1 {
                issues.push(issue(
                    &format!("tasks[{}]", i),
                    "each task entry must be a single `id: spec` mapping",
                ));
            }

            for (id, spec) in entry {
                if !seen_ids.insert(id.clone()) {
                    issues.push(issue(
                        &format!("tasks[{}].{}", i, id),
                        "duplicate task id",
                    ));
                }
                if spec.module.trim().is_empty() {
                    issues.push(issue(
                        &format!("tasks[{}].{}.module", i, id),
                        "module must not be empty",
                    ));
                }

                let mut seen_notify = HashSet::new();
                for (n, handler) in spec.notify.iter().enumerate() {
                    if handler.trim().is_empty() {
                        issues.push(issue(
                            &format!("tasks[{}].{}.notify[{}]", i, id, n),
                            "handler name must not be empty",
                        ));
                    } else if !seen_notify.insert(handler.clone()) {
                        issues.push(issue(
                            &format!("tasks[{}].{}.notify[{}]", i, id, n),
                            "duplicate handler name",
                        ));
                    }
                }
            }
        }

        for (i, handler) in self.handlers.iter().enumerate() {
            if handler.name.trim().is_empty() {
                issues.push(issue(
                    &format!("handlers[{}].name", i),
                    "handler name must not be empty",
                ));
            }
            if handler.module.trim().is_empty() {
                issues.push(issue(
                    &format!("handlers[{}].module", i),
                    "handler module must not be empty",
                ));
            }
        }

        issues
    }

    /// Flatten the ordered `id -> spec` entries
    pub fn task_entries(&self) -> impl Iterator<Item = (&String, &TaskSpec)> {
        self.tasks.iter().flat_map(|entry| entry.iter())
    }
}

fn issue(field: &str, message: &str) -> ValidationIssue {
    ValidationIssue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYBOOK: &str = r#"
name: deploy web tier
hosts: [web]
vars:
  app_name: foo
tasks:
  - make_dir:
      module: file
      args:
        path: /opt/{{app_name}}
        state: directory
  - run_install:
      module: shell
      args:
        script: ./install.sh
      retries: 2
      delay: 5s
"#;

    #[test]
    fn test_parse_ordered_tasks() {
        let playbook = TaskConfig::parse(PLAYBOOK).unwrap();
        let ids: Vec<&String> = playbook.task_entries().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["make_dir", "run_install"]);

        let (_, spec) = playbook.task_entries().nth(1).unwrap();
        assert_eq!(spec.module, "shell");
        assert_eq!(spec.retries, 2);
        assert_eq!(spec.delay_duration().unwrap(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = TaskConfig::parse("description: nothing else").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("name"));
        assert!(text.contains("hosts"));
        assert!(text.contains("at least one task"));
    }

    #[test]
    fn test_duplicate_task_ids_rejected() {
        let err = TaskConfig::parse(
            r#"
name: dupes
hosts: [web]
tasks:
  - step: {module: command, args: {cmd: "true"}}
  - step: {module: command, args: {cmd: "false"}}
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate task id"));
    }

    #[test]
    fn test_delay_forms() {
        let mut spec = TaskSpec::new("command");
        spec.delay = Some(Value::Number(7.into()));
        assert_eq!(spec.delay_duration().unwrap(), Some(Duration::from_secs(7)));

        spec.delay = Some(Value::String("250ms".into()));
        assert_eq!(
            spec.delay_duration().unwrap(),
            Some(Duration::from_millis(250))
        );

        spec.delay = Some(Value::String("2m".into()));
        assert_eq!(
            spec.delay_duration().unwrap(),
            Some(Duration::from_secs(120))
        );

        spec.delay = Some(Value::Bool(true));
        assert!(spec.delay_duration().is_err());
    }

    #[test]
    fn test_tag_matching() {
        let mut spec = TaskSpec::new("command");
        spec.tags = vec!["deploy".to_string()];

        assert!(spec.matches_tags(&[]));
        assert!(spec.matches_tags(&["deploy".to_string()]));
        assert!(!spec.matches_tags(&["cleanup".to_string()]));
    }

    #[test]
    fn test_handlers_are_schema_checked() {
        let err = TaskConfig::parse(
            r#"
name: handlers
hosts: [web]
tasks:
  - step: {module: command, args: {cmd: "true"}}
handlers:
  - name: ""
    module: shell
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("handler name"));
    }
}
