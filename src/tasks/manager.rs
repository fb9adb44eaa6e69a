//! Task lifecycle orchestration.
//!
//! [`TaskManager`] owns every `TaskInfo` transition. Submission picks an
//! execution path once per task: enqueue through the broker when one is
//! configured, otherwise spawn the handler on the local runtime. Workers and
//! local executors both report back through the manager, never by mutating
//! records directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{BrokerClient, JobMessage};
use super::store::TaskStore;
use super::types::{TaskInfo, TaskPriority, TaskStats, TaskStatus};
use super::TaskError;
use crate::config::TaskConfig;

/// Job body invoked by the local executor or a queue consumer.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobContext) -> anyhow::Result<Value>;
}

/// Everything a handler needs while running one job.
pub struct JobContext {
    pub task_id: Uuid,
    pub job_type: String,
    pub payload: HashMap<String, Value>,
    pub progress: ProgressHandle,
}

/// Handle a running job uses to report progress. Failed reports are logged
/// and dropped; progress is advisory and must never fail the job.
#[derive(Clone)]
pub struct ProgressHandle {
    store: Arc<dyn TaskStore>,
    task_id: Uuid,
}

impl ProgressHandle {
    pub async fn report(&self, progress: f64) {
        match self.store.update_progress(self.task_id, progress, None).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %self.task_id, "Progress report ignored (task terminal or gone)")
            }
            Err(e) => warn!(task_id = %self.task_id, error = %e, "Progress report failed"),
        }
    }
}

struct ManagerInner {
    store: Arc<dyn TaskStore>,
    broker: Option<Arc<BrokerClient>>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    config: TaskConfig,
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Option<Arc<BrokerClient>>,
        config: TaskConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                broker,
                handlers: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.write().insert(job_type.into(), handler);
    }

    pub fn has_broker(&self) -> bool {
        self.inner.broker.is_some()
    }

    /// Record a new task and dispatch it. The broker-vs-local decision is
    /// made here, once; a broker enqueue failure falls back to local
    /// execution for this task instead of failing the submission.
    pub async fn create_task(
        &self,
        job_type: impl Into<String>,
        payload: HashMap<String, Value>,
    ) -> Result<Uuid, TaskError> {
        self.create_task_with(job_type, payload, TaskPriority::Normal, None)
            .await
    }

    /// `create_task` with explicit priority and caller identity, for callers
    /// (the HTTP layer) that carry a session or service name.
    pub async fn create_task_with(
        &self,
        job_type: impl Into<String>,
        payload: HashMap<String, Value>,
        priority: TaskPriority,
        created_by: Option<String>,
    ) -> Result<Uuid, TaskError> {
        let job_type = job_type.into();
        let mut task =
            TaskInfo::new(job_type.clone(), payload.clone(), self.inner.config.max_retries);
        task.priority = priority;
        task.created_by = created_by;
        let task_id = task.task_id;
        self.inner.store.insert(task).await?;

        if let Some(broker) = &self.inner.broker {
            let message = JobMessage::new(task_id, job_type.clone(), payload.clone());
            match broker.enqueue(&job_type, &message).await {
                Ok(()) => {
                    info!(task_id = %task_id, job_type = %job_type, "Task dispatched to broker");
                    return Ok(task_id);
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        error = %e,
                        "Broker enqueue failed, falling back to local execution"
                    );
                }
            }
        }

        self.spawn_local(task_id, job_type, payload);
        Ok(task_id)
    }

    /// Run the handler on the local runtime. Used when no broker is
    /// configured or an enqueue fails.
    fn spawn_local(&self, task_id: Uuid, job_type: String, payload: HashMap<String, Value>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let handler = manager.inner.handlers.read().get(&job_type).cloned();
            let Some(handler) = handler else {
                error!(task_id = %task_id, job_type = %job_type, "No handler for local execution");
                let _ = manager
                    .complete_task(
                        task_id,
                        None,
                        Some(format!("no handler registered for {job_type}")),
                    )
                    .await;
                return;
            };

            match manager.inner.store.mark_started(task_id).await {
                Ok(true) => {}
                // Cancelled (or vanished) before the executor got to it.
                Ok(false) => {
                    debug!(task_id = %task_id, "Skipping execution, task no longer pending");
                    return;
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to claim task");
                    return;
                }
            }

            let handle = manager.spawn_handler(handler, task_id, job_type, payload);
            let outcome = Self::handler_outcome(handle.await);
            manager.finish(task_id, outcome).await;
        });
    }

    /// Execute a job pulled off the broker by a queue consumer, under the
    /// configured time limits. The soft limit only warns; the hard limit
    /// fails the task while the record stays consistent.
    pub async fn execute_enqueued(&self, message: JobMessage) -> Result<(), TaskError> {
        let JobMessage {
            task_id,
            job_type,
            payload,
            ..
        } = message;

        let handler = self.inner.handlers.read().get(&job_type).cloned();
        let Some(handler) = handler else {
            warn!(task_id = %task_id, job_type = %job_type, "No handler for dequeued job");
            self.complete_task(
                task_id,
                None,
                Some(format!("no handler registered for {job_type}")),
            )
            .await?;
            return Err(TaskError::HandlerNotFound { job_type });
        };

        if !self.inner.store.mark_started(task_id).await? {
            debug!(task_id = %task_id, "Skipping dequeued job, task no longer pending");
            return Ok(());
        }

        let soft_limit = self.inner.config.soft_time_limit;
        let hard_limit = self.inner.config.hard_time_limit;
        let mut handle = self.spawn_handler(handler, task_id, job_type.clone(), payload);

        let soft = tokio::time::sleep(soft_limit);
        tokio::pin!(soft);
        let hard = tokio::time::sleep(hard_limit);
        tokio::pin!(hard);

        let mut soft_elapsed = false;
        let outcome = loop {
            tokio::select! {
                joined = &mut handle => break Some(Self::handler_outcome(joined)),
                _ = &mut soft, if !soft_elapsed => {
                    soft_elapsed = true;
                    warn!(
                        task_id = %task_id,
                        job_type = %job_type,
                        limit_secs = soft_limit.as_secs(),
                        "Job exceeded soft time limit"
                    );
                }
                _ = &mut hard => {
                    // The handler must actually stop, not just be declared
                    // failed while it keeps consuming resources.
                    handle.abort();
                    let _ = handle.await;
                    break None;
                }
            }
        };

        let outcome = outcome.unwrap_or_else(|| {
            error!(
                task_id = %task_id,
                job_type = %job_type,
                limit_secs = hard_limit.as_secs(),
                "Job exceeded hard time limit"
            );
            Err(format!(
                "hard time limit exceeded ({}s)",
                hard_limit.as_secs()
            ))
        });
        self.finish(task_id, outcome).await;
        Ok(())
    }

    /// Run the handler in its own task so a panic is contained and recorded
    /// as a failure instead of unwinding the executor, and so the caller can
    /// abort it when a time limit elapses.
    fn spawn_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        task_id: Uuid,
        job_type: String,
        payload: HashMap<String, Value>,
    ) -> tokio::task::JoinHandle<anyhow::Result<Value>> {
        let context = JobContext {
            task_id,
            job_type,
            payload,
            progress: ProgressHandle {
                store: Arc::clone(&self.inner.store),
                task_id,
            },
        };
        tokio::spawn(async move { handler.run(context).await })
    }

    fn handler_outcome(
        joined: Result<anyhow::Result<Value>, tokio::task::JoinError>,
    ) -> Result<Value, String> {
        match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_error) if join_error.is_panic() => Err("job handler panicked".to_string()),
            Err(join_error) => Err(format!("job execution aborted: {join_error}")),
        }
    }

    async fn finish(&self, task_id: Uuid, outcome: Result<Value, String>) {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(message) => (None, Some(message)),
        };
        match self.complete_task(task_id, result, error).await {
            Ok(true) => {}
            // A cancel won the race; the terminal state stands.
            Ok(false) => debug!(task_id = %task_id, "Completion discarded, task already terminal"),
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to record completion"),
        }
    }

    pub async fn get_status(&self, task_id: Uuid) -> Result<Option<TaskInfo>, TaskError> {
        self.inner.store.get(task_id).await
    }

    pub async fn update_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> Result<bool, TaskError> {
        self.inner.store.update_progress(task_id, progress, status).await
    }

    /// Finalize a task: failure when `error` is non-empty, success otherwise.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, TaskError> {
        let applied = self.inner.store.complete(task_id, result, error).await?;
        if applied {
            debug!(task_id = %task_id, "Task completed");
        }
        Ok(applied)
    }

    /// Request cancellation. Returns `false` for unknown or already-terminal
    /// tasks. A running job body is not interrupted; its eventual completion
    /// report is discarded against the cancelled record.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, TaskError> {
        let cancelled = self.inner.store.cancel(task_id).await?;
        if cancelled {
            info!(task_id = %task_id, "Task cancelled");
        }
        Ok(cancelled)
    }

    pub async fn cleanup_old_tasks(
        &self,
        max_age: std::time::Duration,
    ) -> Result<u64, TaskError> {
        self.inner.store.cleanup_old(max_age).await
    }

    pub async fn stats(&self) -> Result<TaskStats, TaskError> {
        self.inner.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::MemoryTaskStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(&self, job: JobContext) -> anyhow::Result<Value> {
            job.progress.report(50.0).await;
            Ok(serde_json::json!({ "echo": job.payload }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn run(&self, _job: JobContext) -> anyhow::Result<Value> {
            anyhow::bail!("render failed")
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn run(&self, _job: JobContext) -> anyhow::Result<Value> {
            panic!("boom")
        }
    }

    /// Blocks until released, then reports success.
    struct GatedHandler {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn run(&self, _job: JobContext) -> anyhow::Result<Value> {
            self.gate.notified().await;
            Ok(serde_json::json!("late result"))
        }
    }

    fn manager() -> TaskManager {
        TaskManager::new(
            Arc::new(MemoryTaskStore::new()),
            None,
            TaskConfig::default(),
        )
    }

    async fn wait_for_terminal(manager: &TaskManager, task_id: Uuid) -> TaskInfo {
        for _ in 0..200 {
            if let Some(task) = manager.get_status(task_id).await.unwrap() {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn local_execution_runs_to_success() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(EchoHandler));

        let mut payload = HashMap::new();
        payload.insert("deck".to_string(), serde_json::json!("standard"));
        let task_id = manager.create_task("pdf_generation", payload).await.unwrap();

        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 100.0);
        assert!(task.result.is_some());
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn handler_errors_become_failures() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(FailingHandler));

        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();
        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.error.as_deref(), Some("render failed"));
    }

    #[tokio::test]
    async fn handler_panics_become_failures() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(PanickingHandler));

        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();
        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_task() {
        let manager = manager();
        let task_id = manager
            .create_task("unknown_job", HashMap::new())
            .await
            .unwrap();
        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn cancellation_beats_late_completion() {
        let manager = manager();
        let gate = Arc::new(Notify::new());
        manager.register_handler(
            "pdf_generation",
            Arc::new(GatedHandler {
                gate: Arc::clone(&gate),
            }),
        );

        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();

        // Let the executor claim the task before cancelling.
        for _ in 0..200 {
            let task = manager.get_status(task_id).await.unwrap().unwrap();
            if task.status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.cancel_task(task_id).await.unwrap());

        // Release the handler; its success report must be discarded.
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = manager.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn cancelling_pending_task_prevents_execution() {
        // Cancel before any executor claims the task; the claim must then
        // be refused.
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let direct = TaskManager::new(Arc::clone(&store), None, TaskConfig::default());
        let task = TaskInfo::new("pdf_generation", HashMap::new(), 3);
        let task_id = task.task_id;
        store.insert(task).await.unwrap();
        assert!(direct.cancel_task(task_id).await.unwrap());
        assert!(!store.mark_started(task_id).await.unwrap());

        let task = direct.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_returns_false() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(EchoHandler));
        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();
        wait_for_terminal(&manager, task_id).await;
        assert!(!manager.cancel_task(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn enqueued_jobs_respect_the_hard_time_limit() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let config = TaskConfig {
            soft_time_limit: Duration::from_millis(20),
            hard_time_limit: Duration::from_millis(60),
            ..TaskConfig::default()
        };
        let manager = TaskManager::new(Arc::clone(&store), None, config);
        let gate = Arc::new(Notify::new());
        manager.register_handler("pdf_generation", Arc::new(GatedHandler { gate }));

        let task = TaskInfo::new("pdf_generation", HashMap::new(), 3);
        let task_id = task.task_id;
        store.insert(task).await.unwrap();

        let message = JobMessage::new(task_id, "pdf_generation", HashMap::new());
        manager.execute_enqueued(message).await.unwrap();

        let task = manager.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.error.unwrap().contains("hard time limit"));
    }

    #[tokio::test]
    async fn hard_limit_aborts_the_running_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Sleeps well past the hard limit, then flips `finished`.
        struct SlowHandler {
            finished: Arc<AtomicBool>,
        }

        #[async_trait]
        impl JobHandler for SlowHandler {
            async fn run(&self, _job: JobContext) -> anyhow::Result<Value> {
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(serde_json::json!("too late"))
            }
        }

        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let config = TaskConfig {
            soft_time_limit: Duration::from_millis(20),
            hard_time_limit: Duration::from_millis(60),
            ..TaskConfig::default()
        };
        let manager = TaskManager::new(Arc::clone(&store), None, config);
        let finished = Arc::new(AtomicBool::new(false));
        manager.register_handler(
            "pdf_generation",
            Arc::new(SlowHandler {
                finished: Arc::clone(&finished),
            }),
        );

        let task = TaskInfo::new("pdf_generation", HashMap::new(), 3);
        let task_id = task.task_id;
        store.insert(task).await.unwrap();

        let message = JobMessage::new(task_id, "pdf_generation", HashMap::new());
        manager.execute_enqueued(message).await.unwrap();

        let task = manager.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failure);

        // The handler task was aborted, not left running in the background;
        // given its full sleep it would have flipped the flag by now.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn submission_records_priority_and_caller() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(EchoHandler));

        let task_id = manager
            .create_task_with(
                "pdf_generation",
                HashMap::new(),
                TaskPriority::High,
                Some("session-42".to_string()),
            )
            .await
            .unwrap();

        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.created_by.as_deref(), Some("session-42"));

        // The plain entry point keeps the defaults.
        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();
        let task = wait_for_terminal(&manager, task_id).await;
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(task.created_by.is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_finished_tasks() {
        let manager = manager();
        manager.register_handler("pdf_generation", Arc::new(EchoHandler));
        let task_id = manager
            .create_task("pdf_generation", HashMap::new())
            .await
            .unwrap();
        wait_for_terminal(&manager, task_id).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = manager
            .cleanup_old_tasks(Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(manager.get_status(task_id).await.unwrap().is_none());
    }
}
