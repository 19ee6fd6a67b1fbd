// Project tree validation for the `check` subcommand

use std::path::{Path, PathBuf};

use crate::output::Logger;
use crate::playbook::TaskConfig;

use super::Config;

/// Validate a project: the config file itself, then every YAML file under
/// the `tasks/`, `vars/` and `files/` directories next to it.
///
/// Returns one message per finding; an empty result means the project is
/// clean.
pub fn check_project(config_path: &Path, logger: &Logger) -> Vec<String> {
    let mut findings = Vec::new();

    logger.info(format!("checking config {}", config_path.display()));
    if let Err(err) = Config::load(config_path) {
        findings.push(format!("{}: {}", config_path.display(), first_line(&err)));
    }

    let project_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    for sub in ["tasks", "vars", "files"] {
        let dir = project_dir.join(sub);
        if !dir.is_dir() {
            continue;
        }

        logger.info(format!("checking directory {}", dir.display()));
        logger.increase_indent();
        for file in yaml_files(&dir) {
            check_yaml_file(&file, sub == "tasks", logger, &mut findings);
        }
        logger.decrease_indent();
    }

    findings
}

fn check_yaml_file(path: &Path, is_playbook: bool, logger: &Logger, findings: &mut Vec<String>) {
    logger.debug(format!("checking {}", path.display()));

    if is_playbook {
        // Playbooks get full schema validation, not just a syntax pass
        match TaskConfig::load(path) {
            Ok(_) => logger.success(format!("{} ok", path.display())),
            Err(err) => findings.push(format!("{}: {}", path.display(), first_line(&err))),
        }
        return;
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<serde_yaml::Value>(&content) {
            Ok(_) => logger.success(format!("{} ok", path.display())),
            Err(err) => findings.push(format!("{}: invalid YAML: {}", path.display(), err)),
        },
        Err(err) => findings.push(format!("{}: unreadable: {}", path.display(), err)),
    }
}

/// Recursively collect .yaml/.yml files, sorted for stable reporting
fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_yaml(dir, &mut files);
    files.sort();
    files
}

fn collect_yaml(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_yaml(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}

fn first_line(err: &crate::output::ArmadaError) -> String {
    err.to_string().lines().next().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_clean_project_has_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        write(&config, "hosts:\n  web: [\"10.0.0.1\"]\n");
        write(
            &dir.path().join("tasks/main.yaml"),
            "name: demo\nhosts: [web]\ntasks:\n  - step: {module: command, args: {cmd: uptime}}\n",
        );
        write(&dir.path().join("vars/common.yaml"), "app: demo\n");

        let findings = check_project(&config, &Logger::new(false));
        assert!(findings.is_empty(), "unexpected findings: {:?}", findings);
    }

    #[test]
    fn test_broken_playbook_and_vars_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        write(&config, "hosts:\n  web: [\"10.0.0.1\"]\n");
        // Playbook missing required fields
        write(&dir.path().join("tasks/main.yaml"), "description: no name\n");
        // Vars file with invalid YAML
        write(&dir.path().join("vars/bad.yaml"), "key: [unclosed\n");

        let findings = check_project(&config, &Logger::new(false));
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().any(|f| f.contains("main.yaml")));
        assert!(findings.iter().any(|f| f.contains("bad.yaml")));
    }

    #[test]
    fn test_missing_config_is_a_finding() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");

        let findings = check_project(&config, &Logger::new(false));
        assert_eq!(findings.len(), 1);
    }
}
