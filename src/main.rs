// Armada CLI - scaffold, validate and run projects

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use armada::config::checker::check_project;
use armada::engine::{ExecutionOptions, PlaybookRunner};
use armada::output::Logger;
use armada::Config;

#[derive(Parser)]
#[command(
    name = "armada",
    about = "Declarative remote execution over SSH",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new project tree
    Init {
        /// Project name
        #[arg(long, default_value = "armada-project")]
        name: String,

        /// Directory to create the project in
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },

    /// Validate a project's config, tasks, vars and files
    Check {
        /// Path to config.yaml
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run tasks/main.yaml next to the config
    Run {
        /// Path to config.yaml
        #[arg(short, long)]
        config: PathBuf,

        /// Verbose (debug) output
        #[arg(short, long)]
        verbose: bool,

        /// Worker pool size override
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Only run tasks carrying one of these tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { name, path } => init_project(&name, &path),
        Commands::Check { config } => {
            let logger = Logger::new(false);
            let findings = check_project(&config, &logger);
            if findings.is_empty() {
                logger.success("project is clean");
                ExitCode::SUCCESS
            } else {
                for finding in &findings {
                    eprintln!("{}", finding);
                }
                ExitCode::FAILURE
            }
        }
        Commands::Run {
            config,
            verbose,
            parallel,
            tags,
        } => run_project(&config, verbose, parallel, tags).await,
    }
}

async fn run_project(
    config_path: &Path,
    verbose: bool,
    parallel: Option<usize>,
    tags: Vec<String>,
) -> ExitCode {
    let logger = Arc::new(Logger::new(verbose));

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut options = ExecutionOptions {
        max_parallel: config.ssh.effective_max_parallel(),
        debug: verbose,
        ..Default::default()
    };
    if let Some(parallel) = parallel {
        options.max_parallel = parallel.max(1);
    }

    let playbook = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("tasks")
        .join("main.yaml");

    let runner = PlaybookRunner::new(config, logger.clone())
        .with_options(options)
        .with_tags(tags);

    match runner.run(&playbook).await {
        Ok(recap) => {
            logger.success(format!(
                "run complete: {}/{} task(s) succeeded",
                recap.succeeded(),
                recap.total_tasks()
            ));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"ssh:
  user: root
  # password: change-me
  # key_file: ~/.ssh/id_ed25519
  # use_key_auth: true
  timeout: 10
  max_parallel: 10

hosts:
  local:
    - {host: 127.0.0.1, connection_type: local}

vars:
  example_var: "value"
"#;

const PLAYBOOK_TEMPLATE: &str = r#"name: main
description: starter playbook
hosts: [local]
tasks:
  - ping:
      module: command
      args:
        cmd: echo 'it works'
"#;

fn init_project(name: &str, path: &Path) -> ExitCode {
    let logger = Logger::new(false);
    let root = path.join(name);

    let result = (|| -> std::io::Result<()> {
        for sub in ["tasks", "vars", "files"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir)?;
            logger.info(format!("created {}", dir.display()));
        }

        let config = root.join("config.yaml");
        if !config.exists() {
            std::fs::write(&config, CONFIG_TEMPLATE)?;
            logger.info(format!("created {}", config.display()));
        }

        let playbook = root.join("tasks").join("main.yaml");
        if !playbook.exists() {
            std::fs::write(&playbook, PLAYBOOK_TEMPLATE)?;
            logger.info(format!("created {}", playbook.display()));
        }

        Ok(())
    })();

    match result {
        Ok(()) => {
            logger.success(format!("project {} initialized", name));
            ExitCode::SUCCESS
        }
        Err(err) => {
            logger.error(format!("project init failed: {}", err));
            ExitCode::FAILURE
        }
    }
}
