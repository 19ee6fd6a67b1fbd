// Human-readable error types for Armada

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Errors are typically written to stderr
    std::io::stderr().is_terminal()
}

/// All error types in Armada
#[derive(Debug)]
pub enum ArmadaError {
    /// Parse errors (config, playbook schema)
    Parse(Box<ParseError>),

    /// Local I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Connection errors (dial, auth, host key, lost session)
    Connection {
        host: String,
        message: String,
        retryable: bool,
        suggestion: Option<String>,
    },

    /// Module execution errors (missing arg, wrong type, unsupported op)
    Module(Box<ModuleError>),

    /// Template errors from argument or file rendering
    Template {
        kind: TemplateErrorKind,
        detail: String,
    },

    /// Task queue errors (duplicate id, unknown dependency)
    Queue { message: String },

    /// Variable store errors (merge conflicts, unknown scopes)
    Vars { message: String },

    /// Inventory errors (unknown group, empty host set)
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// Per-task timeout
    Timeout {
        operation: String,
        duration_secs: u64,
    },

    /// Composite error collected over a whole run
    Aggregate(Vec<ArmadaError>),
}

#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub suggestion: Option<String>,
}

#[derive(Debug)]
pub struct ModuleError {
    pub module: String,
    pub task_id: String,
    pub host: String,
    pub message: String,
    pub stderr: Option<String>,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidYaml,
    MissingField,
    InvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateErrorKind {
    /// The template text itself is malformed
    Parse,
    /// The template is well-formed but a reference failed to resolve
    Render,
}

impl ArmadaError {
    /// Shorthand for a parse error without file context
    pub fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ArmadaError::Parse(Box::new(ParseError {
            kind,
            message: message.into(),
            file: None,
            suggestion: None,
        }))
    }

    /// Whether the engine's retry loop should try this task again.
    ///
    /// Only transport-level failures qualify; argument contract violations,
    /// template failures and timeouts are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArmadaError::Connection {
                retryable: true,
                ..
            }
        )
    }
}

impl std::error::Error for ArmadaError {}

impl fmt::Display for ArmadaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            ArmadaError::Parse(err) => {
                writeln!(f, "{}: {}", "PARSE ERROR".red().bold(), err.message)?;
                if let Some(ref file) = err.file {
                    writeln!(f, "  {} {}", "-->".blue(), file.cyan())?;
                }
                if let Some(ref suggestion) = err.suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ArmadaError::Connection {
                host,
                message,
                suggestion,
                ..
            } => {
                writeln!(f, "{}: {}", "CONNECTION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::Module(err) => {
                writeln!(f, "{}: {}", "MODULE ERROR".red().bold(), err.message)?;
                writeln!(f, "  {} {}", "Module:".dimmed(), err.module)?;
                writeln!(f, "  {} {}", "Task:".dimmed(), err.task_id)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), err.host)?;
                if let Some(ref stderr) = err.stderr {
                    if !stderr.is_empty() {
                        writeln!(f)?;
                        writeln!(f, "  {}:", "stderr".dimmed())?;
                        for line in stderr.lines().take(10) {
                            writeln!(f, "    {}", line)?;
                        }
                    }
                }
                if let Some(ref suggestion) = err.suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::Template { kind, detail } => {
                let label = match kind {
                    TemplateErrorKind::Parse => "TEMPLATE PARSE ERROR",
                    TemplateErrorKind::Render => "TEMPLATE RENDER ERROR",
                };
                writeln!(f, "{}: {}", label.red().bold(), detail)
            }

            ArmadaError::Queue { message } => {
                writeln!(f, "{}: {}", "QUEUE ERROR".red().bold(), message)
            }

            ArmadaError::Vars { message } => {
                writeln!(f, "{}: {}", "VARIABLE ERROR".red().bold(), message)
            }

            ArmadaError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::Timeout {
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )
            }

            ArmadaError::Aggregate(errors) => {
                writeln!(
                    f,
                    "{}: run finished with {} error(s)",
                    "RUN FAILED".red().bold(),
                    errors.len()
                )?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, first_line(&err.to_string()))?;
                }
                Ok(())
            }
        }
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classing() {
        let lost = ArmadaError::Connection {
            host: "web1".to_string(),
            message: "session dropped".to_string(),
            retryable: true,
            suggestion: None,
        };
        assert!(lost.is_retryable());

        let auth = ArmadaError::Connection {
            host: "web1".to_string(),
            message: "no authentication method available".to_string(),
            retryable: false,
            suggestion: None,
        };
        assert!(!auth.is_retryable());

        let missing = ArmadaError::parse(ParseErrorKind::MissingField, "playbook requires 'name'");
        assert!(!missing.is_retryable());

        let timeout = ArmadaError::Timeout {
            operation: "task deploy@web1".to_string(),
            duration_secs: 30,
        };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_aggregate_display_lists_each_error() {
        let agg = ArmadaError::Aggregate(vec![
            ArmadaError::Queue {
                message: "task id deploy@web1 already exists".to_string(),
            },
            ArmadaError::Inventory {
                message: "no usable hosts resolved".to_string(),
                suggestion: None,
            },
        ]);

        let text = format!("{}", agg);
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("deploy@web1"));
        assert!(text.contains("no usable hosts"));
    }

    #[test]
    fn test_template_kinds_have_distinct_labels() {
        let parse = ArmadaError::Template {
            kind: TemplateErrorKind::Parse,
            detail: "unclosed '{{'".to_string(),
        };
        let render = ArmadaError::Template {
            kind: TemplateErrorKind::Render,
            detail: "undefined variable 'app_name'".to_string(),
        };

        assert!(format!("{}", parse).contains("TEMPLATE PARSE"));
        assert!(format!("{}", render).contains("TEMPLATE RENDER"));
    }
}
