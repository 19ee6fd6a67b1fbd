// Worker-pool execution engine

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::HostInfo;
use crate::connection::{ConnectionKind, ConnectionManager};
use crate::modules::{ModuleContext, ModuleRegistry};
use crate::output::{ArmadaError, Logger};
use crate::playbook::TaskSpec;
use crate::task::{Task, TaskQueue, TaskResult, TaskStatus};
use crate::vars::{Renderer, VarStore};

/// How workers share the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    Parallel,
    ParallelByHost,
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub mode: ExecutionMode,
    pub max_parallel: usize,
    /// Per-task wall-clock budget
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub ignore_errors: bool,
    pub debug: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        ExecutionOptions {
            mode: ExecutionMode::Parallel,
            max_parallel: 10,
            timeout: Duration::from_secs(30 * 60),
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            ignore_errors: false,
            debug: false,
        }
    }
}

impl ExecutionOptions {
    fn worker_count(&self) -> usize {
        match self.mode {
            ExecutionMode::Serial => 1,
            _ => self.max_parallel.max(1),
        }
    }
}

/// Sub-tasks produced by an `import`, forwarded to the runner for
/// per-host fan-out
#[derive(Debug)]
pub struct ImportedBatch {
    pub specs: Vec<(String, TaskSpec)>,
    /// The imported playbook; becomes the source file of the new tasks
    pub source_file: PathBuf,
    pub depth: u32,
    pub chain: Vec<PathBuf>,
}

/// Pulls ready tasks off the queue with a bounded worker pool, applying
/// per-task timeout and retry, and forwards imported sub-tasks to the
/// runner through a side channel.
pub struct Engine {
    queue: Arc<TaskQueue>,
    worker: Arc<WorkerContext>,
    options: ExecutionOptions,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    imported_rx: Mutex<Option<mpsc::UnboundedReceiver<ImportedBatch>>>,
}

impl Engine {
    pub fn new(
        queue: Arc<TaskQueue>,
        manager: Arc<ConnectionManager>,
        vars: Arc<VarStore>,
        registry: Arc<ModuleRegistry>,
        renderer: Arc<Renderer>,
        options: ExecutionOptions,
        logger: Arc<Logger>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (imported_tx, imported_rx) = mpsc::unbounded_channel();

        let worker = Arc::new(WorkerContext {
            queue: queue.clone(),
            manager,
            module_ctx: ModuleContext::new(vars, renderer),
            registry,
            options: options.clone(),
            logger,
            hosts: DashMap::new(),
            imported_tx,
            in_flight: AtomicUsize::new(0),
            shutdown_rx,
        });

        Engine {
            queue,
            worker,
            options,
            running: AtomicBool::new(false),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            imported_rx: Mutex::new(Some(imported_rx)),
        }
    }

    /// Host records the engine consults for port and transport kind
    pub fn set_hosts(&self, hosts: HashMap<String, HostInfo>) {
        self.worker.hosts.clear();
        for (name, info) in hosts {
            self.worker.hosts.insert(name, info);
        }
    }

    /// Take the imported-task side channel (once)
    pub fn take_imported_receiver(&self) -> Option<mpsc::UnboundedReceiver<ImportedBatch>> {
        self.imported_rx.lock().take()
    }

    pub fn add_task(&self, task: Task) -> Result<(), ArmadaError> {
        self.queue.push(task)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Tasks currently being executed by a worker
    pub fn in_flight(&self) -> usize {
        self.worker.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker pool. Starting twice is an error.
    pub fn start(&self) -> Result<(), ArmadaError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ArmadaError::Queue {
                message: "engine is already running".to_string(),
            });
        }

        let _ = self.shutdown_tx.send(false);
        let mut workers = self.workers.lock();
        for _ in 0..self.options.worker_count() {
            let ctx = self.worker.clone();
            workers.push(tokio::spawn(async move { ctx.run().await }));
        }
        Ok(())
    }

    /// Cancel the workers and wait for them to drain
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.queue.get(id).map(|t| t.lock().status)
    }

    /// The result is present only after the task reached a terminal state
    pub fn task_result(&self, id: &str) -> Option<TaskResult> {
        self.queue.get(id).and_then(|t| t.lock().result.clone())
    }
}

/// Everything a worker task needs, shared by Arc
struct WorkerContext {
    queue: Arc<TaskQueue>,
    manager: Arc<ConnectionManager>,
    module_ctx: ModuleContext,
    registry: Arc<ModuleRegistry>,
    options: ExecutionOptions,
    logger: Arc<Logger>,
    hosts: DashMap<String, HostInfo>,
    imported_tx: mpsc::UnboundedSender<ImportedBatch>,
    in_flight: AtomicUsize,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerContext {
    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                return;
            }

            // Claim in-flight before popping so the runner's quiescence
            // check cannot observe a popped-but-unclaimed task
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            match self.queue.pop() {
                Some(task) => {
                    self.execute_task(task).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }

    async fn execute_task(&self, task: Arc<parking_lot::Mutex<Task>>) {
        let (id, host, spec) = {
            let mut task = task.lock();
            task.start_time = Some(Local::now());
            (task.id.clone(), task.host.clone(), task.spec.clone())
        };

        if self.queue.update_status(&id, TaskStatus::Running).is_err() {
            return;
        }
        self.logger
            .debug(format!("task {} starting on {}", id, host));

        // `when` gate: skip unless the predicate renders truthy
        if let Some(when) = &spec.when {
            match self.evaluate_when(&task, when) {
                Ok(true) => {}
                Ok(false) => {
                    self.finish(&task, &id, Ok(TaskResult::skipped())).await;
                    return;
                }
                Err(err) => {
                    self.finish(&task, &id, Err(err)).await;
                    return;
                }
            }
        }

        let (port, kind) = self.endpoint(&host);
        let handle = match self.manager.get(&host, port, kind).await {
            Ok(handle) => handle,
            Err(err) => {
                self.finish(&task, &id, Err(err)).await;
                return;
            }
        };

        let module = match self.registry.get(&spec.module) {
            Some(module) => module,
            None => {
                let err = ArmadaError::Module(Box::new(crate::output::ModuleError {
                    module: spec.module.clone(),
                    task_id: id.clone(),
                    host: host.clone(),
                    message: format!("unknown module '{}'", spec.module),
                    stderr: None,
                    suggestion: None,
                }));
                self.finish(&task, &id, Err(err)).await;
                return;
            }
        };

        let max_retries = if spec.retries > 0 {
            spec.retries
        } else {
            self.options.max_retries
        };
        let retry_interval = match spec.delay_duration() {
            Ok(Some(delay)) => delay,
            Ok(None) => self.options.retry_interval,
            Err(err) => {
                self.finish(&task, &id, Err(err)).await;
                return;
            }
        };

        let mut outcome: Result<TaskResult, ArmadaError> = Err(ArmadaError::Queue {
            message: "task never executed".to_string(),
        });

        for attempt in 0..=max_retries {
            if attempt > 0 {
                self.logger.debug(format!(
                    "task {} retry {}/{} after {:?}",
                    id, attempt, max_retries, retry_interval
                ));
                tokio::time::sleep(retry_interval).await;
            }

            let snapshot = {
                let mut task = task.lock();
                task.retry_count = attempt;
                task.clone()
            };

            match tokio::time::timeout(
                self.options.timeout,
                module.execute(&self.module_ctx, &snapshot, handle.conn()),
            )
            .await
            {
                Err(_) => {
                    outcome = Err(ArmadaError::Timeout {
                        operation: format!("task {}", id),
                        duration_secs: self.options.timeout.as_secs(),
                    });
                    break;
                }
                Ok(Ok(result)) => {
                    outcome = Ok(result);
                    break;
                }
                Ok(Err(err)) => {
                    let retry = err.is_retryable() && attempt < max_retries;
                    outcome = Err(err);
                    if !retry {
                        break;
                    }
                }
            }
        }

        // The pool handle drops here on every path, releasing the entry
        drop(handle);
        self.finish(&task, &id, outcome).await;
    }

    fn evaluate_when(
        &self,
        task: &Arc<parking_lot::Mutex<Task>>,
        when: &str,
    ) -> Result<bool, ArmadaError> {
        let snapshot = task.lock().clone();
        let extra = self.module_ctx.overlay(&snapshot);
        let rendered = self.module_ctx.renderer.render_string(when, Some(&extra))?;
        let rendered = rendered.trim();
        Ok(!rendered.is_empty() && rendered != "false" && rendered != "0")
    }

    fn endpoint(&self, host: &str) -> (u16, ConnectionKind) {
        self.hosts
            .get(host)
            .map(|info| (info.port, info.connection_type))
            .unwrap_or((22, ConnectionKind::Ssh))
    }

    /// Stamp the end time, record the outcome, transition the final status
    /// and forward any imported sub-tasks.
    async fn finish(
        &self,
        task: &Arc<parking_lot::Mutex<Task>>,
        id: &str,
        outcome: Result<TaskResult, ArmadaError>,
    ) {
        let status = match &outcome {
            Ok(result) if result.failed => TaskStatus::Failed,
            Ok(result) if result.skipped => TaskStatus::Skipped,
            Ok(_) => TaskStatus::Success,
            Err(_) => TaskStatus::Failed,
        };

        let batch = {
            let mut task = task.lock();
            task.end_time = Some(Local::now());

            match outcome {
                Ok(result) => {
                    let batch = self.batch_from(&task, &result);
                    task.result = Some(result);
                    batch
                }
                Err(err) => {
                    if let ArmadaError::Timeout { duration_secs, .. } = &err {
                        task.result = Some(TaskResult {
                            failed: true,
                            timed_out: true,
                            duration: Duration::from_secs(*duration_secs),
                            ..Default::default()
                        });
                    }
                    task.error = Some(err.to_string());
                    None
                }
            }
        };

        if let Err(err) = self.queue.update_status(id, status) {
            self.logger
                .warning(format!("status transition rejected: {}", err));
        }

        let (host, stdout, stderr, error) = {
            let task = task.lock();
            (
                task.host.clone(),
                task.result.as_ref().map(|r| r.stdout.clone()),
                task.result.as_ref().map(|r| r.stderr.clone()),
                task.error.clone(),
            )
        };

        match status {
            TaskStatus::Success => {
                self.logger.success(format!("task {} on {}", id, host));
                if let Some(stdout) = stdout.filter(|s| !s.is_empty()) {
                    self.logger.output(&host, id, &stdout);
                }
                if let Some(stderr) = stderr.filter(|s| !s.is_empty()) {
                    self.logger.output(&host, id, &stderr);
                }
            }
            TaskStatus::Skipped => self.logger.info(format!("task {} skipped on {}", id, host)),
            _ => {
                let detail = error.unwrap_or_else(|| "task failed".to_string());
                self.logger.error(format!(
                    "task {} failed on {}: {}",
                    id,
                    host,
                    detail.lines().next().unwrap_or("")
                ));
                if let Some(stderr) = stderr.filter(|s| !s.is_empty()) {
                    self.logger.output(&host, id, &stderr);
                }
            }
        }

        if status == TaskStatus::Success {
            if let Some(batch) = batch {
                let _ = self.imported_tx.send(batch);
            }
        }
    }

    /// Build the imported-task batch for a successful import result
    fn batch_from(&self, task: &Task, result: &TaskResult) -> Option<ImportedBatch> {
        if result.imported_tasks.is_empty() {
            return None;
        }

        let source_file = result
            .extra
            .get("imported_from")
            .map(PathBuf::from)
            .unwrap_or_else(|| task.source_file.clone());

        let mut chain = task.import_chain.clone();
        chain.push(source_file.clone());

        Some(ImportedBatch {
            specs: result.imported_tasks.clone(),
            source_file,
            depth: task.import_depth + 1,
            chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;
    use crate::playbook::TaskSpec;
    use crate::vars::VarManager;
    use serde_yaml::Value;

    fn engine_for_local() -> Engine {
        let queue = Arc::new(TaskQueue::new());
        let manager = Arc::new(ConnectionManager::new(SshConfig::default()));
        let vars = Arc::new(VarStore::new());
        let registry = Arc::new(ModuleRegistry::with_builtins());
        let renderer = Arc::new(Renderer::new(Arc::new(VarManager::new())));
        let options = ExecutionOptions {
            max_parallel: 2,
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        };
        Engine::new(
            queue,
            manager,
            vars,
            registry,
            renderer,
            options,
            Arc::new(Logger::new(false)),
        )
    }

    fn local_host(addr: &str) -> HostInfo {
        crate::config::HostInfo::new(addr).with_kind(ConnectionKind::Local)
    }

    fn command_task(id: &str, host: &str, cmd: &str) -> Task {
        let spec = TaskSpec::new("command").with_arg("cmd", Value::String(cmd.to_string()));
        Task::new(id, Arc::new(spec), host)
    }

    async fn wait_terminal(engine: &Engine, id: &str) {
        for _ in 0..200 {
            if engine
                .task_status(id)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let engine = engine_for_local();
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_executes_command_over_local_connection() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        engine
            .add_task(command_task("hello@127.0.0.1", "127.0.0.1", "echo hi"))
            .unwrap();
        engine.start().unwrap();
        wait_terminal(&engine, "hello@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(
            engine.task_status("hello@127.0.0.1"),
            Some(TaskStatus::Success)
        );
        let result = engine.task_result("hello@127.0.0.1").unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_failing_command_marks_failed() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        engine
            .add_task(command_task("bad@127.0.0.1", "127.0.0.1", "exit 7"))
            .unwrap();
        engine.start().unwrap();
        wait_terminal(&engine, "bad@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(engine.task_status("bad@127.0.0.1"), Some(TaskStatus::Failed));
        let result = engine.task_result("bad@127.0.0.1").unwrap();
        assert_eq!(result.exit_code, 7);
        // Non-zero exit is captured in the result, not retried
        assert!(result.failed);
    }

    #[tokio::test]
    async fn test_unknown_module_fails_task() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        let spec = TaskSpec::new("frobnicate");
        engine
            .add_task(Task::new("x@127.0.0.1", Arc::new(spec), "127.0.0.1"))
            .unwrap();
        engine.start().unwrap();
        wait_terminal(&engine, "x@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(engine.task_status("x@127.0.0.1"), Some(TaskStatus::Failed));
        let task = engine.queue().get("x@127.0.0.1").unwrap();
        assert!(task.lock().error.as_ref().unwrap().contains("unknown module"));
    }

    #[tokio::test]
    async fn test_when_predicate_skips() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        let spec = TaskSpec {
            module: "command".to_string(),
            when: Some("false".to_string()),
            ..Default::default()
        }
        .with_arg("cmd", Value::String("echo never".into()));
        engine
            .add_task(Task::new("gated@127.0.0.1", Arc::new(spec), "127.0.0.1"))
            .unwrap();

        engine.start().unwrap();
        wait_terminal(&engine, "gated@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(
            engine.task_status("gated@127.0.0.1"),
            Some(TaskStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_retryable_error_retries_then_succeeds() {
        use crate::modules::{Module, ModuleContext};
        use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

        // Fails with a retryable transport error on the first two attempts
        struct FlakyModule {
            attempts: AtomicU32,
        }

        #[async_trait::async_trait]
        impl Module for FlakyModule {
            fn name(&self) -> &'static str {
                "flaky"
            }

            async fn execute(
                &self,
                _ctx: &ModuleContext,
                task: &Task,
                _conn: &dyn crate::connection::Connection,
            ) -> Result<TaskResult, ArmadaError> {
                let attempt = self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
                if attempt < 2 {
                    return Err(ArmadaError::Connection {
                        host: task.host.clone(),
                        message: "session dropped".to_string(),
                        retryable: true,
                        suggestion: None,
                    });
                }
                Ok(TaskResult::success().with_stdout("recovered"))
            }
        }

        let registry = ModuleRegistry::with_builtins();
        registry.register(Arc::new(FlakyModule {
            attempts: AtomicU32::new(0),
        }));
        let queue = Arc::new(TaskQueue::new());
        let engine = Engine::new(
            queue,
            Arc::new(ConnectionManager::new(SshConfig::default())),
            Arc::new(VarStore::new()),
            Arc::new(registry),
            Arc::new(Renderer::new(Arc::new(VarManager::new()))),
            ExecutionOptions {
                max_retries: 3,
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(Logger::new(false)),
        );
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        let spec = TaskSpec::new("flaky");
        engine
            .add_task(Task::new("flaky@127.0.0.1", Arc::new(spec), "127.0.0.1"))
            .unwrap();
        let started = std::time::Instant::now();
        engine.start().unwrap();
        wait_terminal(&engine, "flaky@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(
            engine.task_status("flaky@127.0.0.1"),
            Some(TaskStatus::Success)
        );
        let task = engine.queue().get("flaky@127.0.0.1").unwrap();
        assert_eq!(task.lock().retry_count, 2);
        // Two retry sleeps happened
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_task_timeout_fails_with_flag() {
        let queue = Arc::new(TaskQueue::new());
        let engine = Engine::new(
            queue,
            Arc::new(ConnectionManager::new(SshConfig::default())),
            Arc::new(VarStore::new()),
            Arc::new(ModuleRegistry::with_builtins()),
            Arc::new(Renderer::new(Arc::new(VarManager::new()))),
            ExecutionOptions {
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(Logger::new(false)),
        );
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        engine
            .add_task(command_task("slow@127.0.0.1", "127.0.0.1", "sleep 2"))
            .unwrap();
        engine.start().unwrap();
        wait_terminal(&engine, "slow@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(
            engine.task_status("slow@127.0.0.1"),
            Some(TaskStatus::Failed)
        );
        let result = engine.task_result("slow@127.0.0.1").unwrap();
        assert!(result.timed_out);
        assert!(result.failed);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        // Missing required arg is a module contract error, never retried
        let spec = TaskSpec::new("command");
        engine
            .add_task(Task::new("noargs@127.0.0.1", Arc::new(spec), "127.0.0.1"))
            .unwrap();
        engine.start().unwrap();
        wait_terminal(&engine, "noargs@127.0.0.1").await;
        engine.stop().await;

        assert_eq!(
            engine.task_status("noargs@127.0.0.1"),
            Some(TaskStatus::Failed)
        );
        let task = engine.queue().get("noargs@127.0.0.1").unwrap();
        let task = task.lock();
        assert_eq!(task.retry_count, 0);
        assert!(task.error.as_ref().unwrap().contains("missing required"));
    }

    #[tokio::test]
    async fn test_dependency_order_on_one_host() {
        let engine = engine_for_local();
        engine.set_hosts(HashMap::from([(
            "127.0.0.1".to_string(),
            local_host("127.0.0.1"),
        )]));

        let marker = tempfile::tempdir().unwrap();
        let flag = marker.path().join("first-ran");

        engine
            .add_task(command_task(
                "first@127.0.0.1",
                "127.0.0.1",
                &format!("touch {}", flag.display()),
            ))
            .unwrap();
        engine
            .add_task(
                command_task(
                    "second@127.0.0.1",
                    "127.0.0.1",
                    &format!("test -f {}", flag.display()),
                )
                .with_depends_on(vec!["first@127.0.0.1".to_string()]),
            )
            .unwrap();

        engine.start().unwrap();
        wait_terminal(&engine, "second@127.0.0.1").await;
        engine.stop().await;

        // The dependent only succeeds if it observed its dependency's effect
        assert_eq!(
            engine.task_status("second@127.0.0.1"),
            Some(TaskStatus::Success)
        );
    }
}
