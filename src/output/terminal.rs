// Leveled terminal output with per-host framed command output

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use colored::*;

/// Explicit logger handle passed into the engine and runner.
///
/// Indentation is tracked per instance; debug lines only appear in verbose
/// mode.
pub struct Logger {
    indent: AtomicUsize,
    verbose: AtomicBool,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        let is_tty = std::io::stdout().is_terminal();
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        Logger {
            indent: AtomicUsize::new(0),
            verbose: AtomicBool::new(verbose),
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn increase_indent(&self) {
        self.indent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrease_indent(&self) {
        let _ = self
            .indent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn prefix(&self) -> String {
        "  ".repeat(self.indent.load(Ordering::Relaxed))
    }

    fn stamp() -> String {
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        println!(
            "{} {}{}",
            format!("[{}] [INFO]", Self::stamp()).blue(),
            self.prefix(),
            msg.as_ref()
        );
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        println!(
            "{} {}{}",
            format!("[{}] [OK]", Self::stamp()).green(),
            self.prefix(),
            msg.as_ref().green()
        );
    }

    pub fn warning(&self, msg: impl AsRef<str>) {
        println!(
            "{} {}{}",
            format!("[{}] [WARN]", Self::stamp()).yellow(),
            self.prefix(),
            msg.as_ref().yellow()
        );
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        eprintln!(
            "{} {}{}",
            format!("[{}] [ERROR]", Self::stamp()).red(),
            self.prefix(),
            msg.as_ref().red()
        );
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        if !self.is_verbose() {
            return;
        }
        println!(
            "{} {}{}",
            format!("[{}] [DEBUG]", Self::stamp()).purple(),
            self.prefix(),
            msg.as_ref().dimmed()
        );
    }

    /// Print captured command output in a frame tagged by host and task id.
    pub fn output(&self, host: &str, task_id: &str, output: &str) {
        if output.is_empty() {
            return;
        }

        println!(
            "{} {}",
            format!("┌─[{}]", host).cyan(),
            task_id.yellow()
        );
        for line in output.lines() {
            println!("{} {}", "│".cyan(), line);
        }
        println!("{}", "└─────".cyan());
    }

    /// Print the end-of-run recap table.
    pub fn recap(&self, recaps: &[HostRecap]) {
        println!();
        println!("{}", "RUN RECAP".bold());
        println!("{}", "─".repeat(60).dimmed());
        for r in recaps {
            println!(
                "{:<24} {} {}  {} {}  {} {}  {} {}",
                r.host.white().bold(),
                "ok:".green(),
                r.ok,
                "changed:".yellow(),
                r.changed,
                "failed:".red(),
                r.failed,
                "skipped:".cyan(),
                r.skipped,
            );
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Per-host counters for the run recap
#[derive(Debug, Clone, Default)]
pub struct HostRecap {
    pub host: String,
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl HostRecap {
    pub fn new(host: impl Into<String>) -> Self {
        HostRecap {
            host: host.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indent_never_underflows() {
        let log = Logger::new(false);
        log.decrease_indent();
        log.increase_indent();
        log.increase_indent();
        log.decrease_indent();
        assert_eq!(log.prefix(), "  ");
    }

    #[test]
    fn test_verbose_toggle() {
        let log = Logger::new(false);
        assert!(!log.is_verbose());
        log.set_verbose(true);
        assert!(log.is_verbose());
    }
}
