// Playbook runner - resolves hosts, seeds the queue, drives the engine

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{Engine, ExecutionOptions, ImportedBatch};
use crate::config::{Config, HostInfo};
use crate::connection::{ConnectionManager, ConnectionPool};
use crate::modules::ModuleRegistry;
use crate::output::{ArmadaError, HostRecap, Logger, ModuleError};
use crate::playbook::TaskConfig;
use crate::task::{Task, TaskQueue, TaskStatus};
use crate::vars::{Renderer, VarManager, VarStore};

/// How long to wait after the queue looks drained before closing the run;
/// protects against a late import enqueue racing the shutdown.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Outcome of one task, kept for the run summary
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: String,
    pub host: String,
    pub status: TaskStatus,
    pub stdout: String,
}

/// End-of-run aggregate
#[derive(Debug, Clone, Default)]
pub struct RunRecap {
    pub hosts: Vec<HostRecap>,
    pub tasks: Vec<TaskSummary>,
}

impl RunRecap {
    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn succeeded(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .count()
    }
}

/// Loads a playbook, resolves its host groups against the inventory,
/// preflights every host and drives the engine to quiescence.
pub struct PlaybookRunner {
    config: Config,
    logger: Arc<Logger>,
    options: ExecutionOptions,
    tags: Vec<String>,
}

impl PlaybookRunner {
    pub fn new(config: Config, logger: Arc<Logger>) -> Self {
        let options = ExecutionOptions {
            max_parallel: config.ssh.effective_max_parallel(),
            ..Default::default()
        };
        PlaybookRunner {
            config,
            logger,
            options,
            tags: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub async fn run(&self, playbook_path: &Path) -> Result<RunRecap, ArmadaError> {
        let playbook = TaskConfig::load(playbook_path)?;
        let source_file = playbook_path
            .canonicalize()
            .unwrap_or_else(|_| playbook_path.to_path_buf());

        self.logger
            .info(format!("running playbook '{}'", playbook.name));

        let hosts = self.resolve_hosts(&playbook)?;

        // Variable stack: global scope from config + playbook, one host
        // scope per resolved host
        let var_manager = Arc::new(VarManager::new());
        let var_store = Arc::new(VarStore::new());
        for (k, v) in self.config.vars.iter().chain(playbook.vars.iter()) {
            var_manager.set_global(k.clone(), v.clone());
            var_store.set(k.clone(), v.clone());
        }
        for host in &hosts {
            if !host.vars.is_empty() {
                var_manager.set_host_vars(&host.host, host.vars.clone());
            }
        }

        let manager = Arc::new(
            ConnectionManager::new(self.config.ssh.clone()).with_pool(
                ConnectionPool::new().with_max_retries(self.options.max_retries),
            ),
        );

        self.preflight(&manager, &hosts).await?;

        let queue = Arc::new(TaskQueue::new());
        let engine = Engine::new(
            queue.clone(),
            manager.clone(),
            var_store,
            Arc::new(ModuleRegistry::with_builtins()),
            Arc::new(Renderer::new(var_manager)),
            self.options.clone(),
            self.logger.clone(),
        );
        engine.set_hosts(
            hosts
                .iter()
                .map(|h| (h.host.clone(), h.clone()))
                .collect::<HashMap<String, HostInfo>>(),
        );

        let mut errors = Vec::new();

        // Seed one task per (spec, host), in playbook order
        for (name, spec) in playbook.task_entries() {
            if !spec.matches_tags(&self.tags) {
                self.logger
                    .debug(format!("task {} filtered out by tags", name));
                continue;
            }
            let spec = Arc::new(spec.clone());
            for host in &hosts {
                let mut task =
                    Task::new(Task::compose_id(name, &host.host), spec.clone(), &host.host)
                        .with_vars(spec.vars.clone())
                        .with_source_file(source_file.clone());
                task.import_chain = vec![source_file.clone()];
                engine.add_task(task)?;
            }
        }

        let imported_rx = engine
            .take_imported_receiver()
            .expect("imported-task receiver already taken");

        engine.start()?;
        self.drive(&engine, &hosts, imported_rx, &mut errors).await;

        // Tasks still pending are stranded behind failed dependencies
        for id in queue.pending_ids() {
            self.logger
                .warning(format!("task {} never became runnable, cancelling", id));
            let _ = queue.update_status(&id, TaskStatus::Cancelled);
        }

        engine.stop().await;
        manager.pool().close_all().await;

        let recap = self.summarize(&queue, &hosts, &mut errors);
        self.logger.recap(&recap.hosts);

        if errors.is_empty() || self.options.ignore_errors {
            Ok(recap)
        } else {
            Err(ArmadaError::Aggregate(errors))
        }
    }

    /// Expand the playbook's group list against the inventory. `all` is the
    /// union of every group; unknown groups warn; an empty result fails.
    fn resolve_hosts(&self, playbook: &TaskConfig) -> Result<Vec<HostInfo>, ArmadaError> {
        let mut hosts: Vec<HostInfo> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for group in &playbook.hosts {
            if group == "all" {
                for host in self.config.all_hosts() {
                    if seen.insert(host.host.clone()) {
                        hosts.push(host);
                    }
                }
            } else if let Some(group_hosts) = self.config.group_hosts(group) {
                self.logger.info(format!(
                    "group {} resolved to {} host(s)",
                    group,
                    group_hosts.len()
                ));
                for host in group_hosts {
                    if seen.insert(host.host.clone()) {
                        hosts.push(host.clone());
                    }
                }
            } else {
                self.logger
                    .warning(format!("host group {} is not defined", group));
            }
        }

        if hosts.is_empty() {
            return Err(ArmadaError::Inventory {
                message: "no usable hosts resolved from the playbook's groups".to_string(),
                suggestion: Some("check the hosts section of the config".to_string()),
            });
        }

        self.logger
            .success(format!("resolved {} host(s)", hosts.len()));
        Ok(hosts)
    }

    /// Probe every host in parallel before any task runs; a single failure
    /// aborts the run.
    async fn preflight(
        &self,
        manager: &Arc<ConnectionManager>,
        hosts: &[HostInfo],
    ) -> Result<(), ArmadaError> {
        self.logger.info("running connection preflight");
        self.logger.increase_indent();

        let probes = hosts.iter().map(|host| {
            let manager = manager.clone();
            let logger = self.logger.clone();
            async move {
                let result = async {
                    let handle = manager
                        .get(&host.host, host.port, host.connection_type)
                        .await?;
                    if !handle.conn().is_connected() {
                        return Err(ArmadaError::Connection {
                            host: host.host.clone(),
                            message: "connection did not come up".to_string(),
                            retryable: false,
                            suggestion: None,
                        });
                    }
                    handle.conn().execute_command("echo 'Connection test'").await?;
                    Ok::<(), ArmadaError>(())
                }
                .await;

                match result {
                    Ok(()) => {
                        logger.success(format!("host {} reachable", host.host));
                        None
                    }
                    Err(err) => {
                        logger.error(format!(
                            "host {} failed preflight: {}",
                            host.host,
                            err.to_string().lines().next().unwrap_or("")
                        ));
                        Some(host.host.clone())
                    }
                }
            }
        });

        let failed: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
        self.logger.decrease_indent();

        if failed.is_empty() {
            self.logger.success("preflight passed for every host");
            Ok(())
        } else {
            Err(ArmadaError::Connection {
                host: failed.join(", "),
                message: format!("preflight failed for {} host(s)", failed.len()),
                retryable: false,
                suggestion: Some("fix connectivity or credentials and re-run".to_string()),
            })
        }
    }

    /// Poll until the queue is drained and nothing is in flight, consuming
    /// the imported-task channel along the way.
    async fn drive(
        &self,
        engine: &Engine,
        hosts: &[HostInfo],
        mut imported_rx: UnboundedReceiver<ImportedBatch>,
        errors: &mut Vec<ArmadaError>,
    ) {
        loop {
            while let Ok(batch) = imported_rx.try_recv() {
                self.enqueue_batch(engine, hosts, batch, errors);
            }

            if engine.in_flight() == 0 && engine.queue().ready_len() == 0 {
                // Settle, then re-drain: a finishing import may have posted
                // just before the counters went quiet
                tokio::time::sleep(SETTLE_DELAY).await;
                let mut enqueued = false;
                while let Ok(batch) = imported_rx.try_recv() {
                    self.enqueue_batch(engine, hosts, batch, errors);
                    enqueued = true;
                }
                if !enqueued && engine.in_flight() == 0 && engine.queue().ready_len() == 0 {
                    return;
                }
            } else {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// Fan an imported batch out across the host set. The same file
    /// imported on several hosts yields one batch per host; ids already in
    /// the queue are skipped so each (task, host) pair runs once.
    fn enqueue_batch(
        &self,
        engine: &Engine,
        hosts: &[HostInfo],
        batch: ImportedBatch,
        errors: &mut Vec<ArmadaError>,
    ) {
        self.logger.info(format!(
            "enqueueing {} imported task(s) from {}",
            batch.specs.len(),
            batch.source_file.display()
        ));

        for (name, spec) in &batch.specs {
            let spec = Arc::new(spec.clone());
            for host in hosts {
                let id = Task::compose_id(name, &host.host);
                if engine.queue().get(&id).is_some() {
                    self.logger
                        .debug(format!("imported task {} already queued", id));
                    continue;
                }

                let mut task = Task::new(id, spec.clone(), &host.host)
                    .with_vars(spec.vars.clone())
                    .with_source_file(batch.source_file.clone());
                task.import_depth = batch.depth;
                task.import_chain = batch.chain.clone();

                if let Err(err) = engine.add_task(task) {
                    self.logger
                        .warning(format!("failed to enqueue imported task: {}", err));
                    errors.push(err);
                }
            }
        }
    }

    /// Fold the queue into per-host counters and the error aggregate
    fn summarize(
        &self,
        queue: &TaskQueue,
        hosts: &[HostInfo],
        errors: &mut Vec<ArmadaError>,
    ) -> RunRecap {
        let mut by_host: HashMap<String, HostRecap> = hosts
            .iter()
            .map(|h| (h.host.clone(), HostRecap::new(&h.host)))
            .collect();
        let mut tasks = Vec::new();

        for task in queue.list() {
            let task = task.lock();
            let recap = by_host
                .entry(task.host.clone())
                .or_insert_with(|| HostRecap::new(&task.host));

            match task.status {
                TaskStatus::Success => {
                    recap.ok += 1;
                    if task.result.as_ref().map(|r| r.changed).unwrap_or(false) {
                        recap.changed += 1;
                    }
                }
                TaskStatus::Failed => {
                    recap.failed += 1;
                    if !task.spec.ignore_error {
                        errors.push(ArmadaError::Module(Box::new(ModuleError {
                            module: task.spec.module.clone(),
                            task_id: task.id.clone(),
                            host: task.host.clone(),
                            message: task
                                .error
                                .clone()
                                .unwrap_or_else(|| "task failed".to_string()),
                            stderr: task.result.as_ref().map(|r| r.stderr.clone()),
                            suggestion: None,
                        })));
                    }
                }
                TaskStatus::Skipped | TaskStatus::Cancelled => recap.skipped += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            tasks.push(TaskSummary {
                id: task.id.clone(),
                host: task.host.clone(),
                status: task.status,
                stdout: task
                    .result
                    .as_ref()
                    .map(|r| r.stdout.clone())
                    .unwrap_or_default(),
            });
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut host_recaps: Vec<HostRecap> = by_host.into_values().collect();
        host_recaps.sort_by(|a, b| a.host.cmp(&b.host));

        RunRecap {
            hosts: host_recaps,
            tasks,
        }
    }
}
