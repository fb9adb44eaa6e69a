//! Task record storage.
//!
//! Two implementations share one trait: a networked store that keeps records
//! visible to every process, and an in-process map used when no backend is
//! configured. Transition methods return `Ok(false)` both for unknown tasks
//! and for refused transitions (already terminal), so callers treat the two
//! stores identically.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{TaskInfo, TaskStats, TaskStatus};
use super::TaskError;
use crate::config::{BackendConfig, TaskConfig};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: TaskInfo) -> Result<(), TaskError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskInfo>, TaskError>;

    /// Transition the task to `Running` if it is still pending. Returns
    /// `false` when the task is gone or was cancelled first; the executor
    /// must not run the job body in that case.
    async fn mark_started(&self, task_id: Uuid) -> Result<bool, TaskError>;

    async fn update_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> Result<bool, TaskError>;

    async fn complete(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, TaskError>;

    async fn cancel(&self, task_id: Uuid) -> Result<bool, TaskError>;

    /// Remove terminal records completed more than `max_age` ago. Active
    /// tasks are never removed regardless of age.
    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, TaskError>;

    async fn stats(&self) -> Result<TaskStats, TaskError>;
}

/// In-process store used when no shared backend is configured.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<Uuid, TaskInfo>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, task_id: Uuid, apply: F) -> bool
    where
        F: FnOnce(&mut TaskInfo) -> bool,
    {
        match self.tasks.get_mut(&task_id) {
            Some(mut entry) => apply(entry.value_mut()),
            None => false,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: TaskInfo) -> Result<(), TaskError> {
        self.tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskInfo>, TaskError> {
        Ok(self.tasks.get(&task_id).map(|entry| entry.clone()))
    }

    async fn mark_started(&self, task_id: Uuid) -> Result<bool, TaskError> {
        Ok(self.mutate(task_id, |task| {
            task.status == TaskStatus::Pending && task.apply_start()
        }))
    }

    async fn update_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> Result<bool, TaskError> {
        Ok(self.mutate(task_id, |task| task.apply_progress(progress, status)))
    }

    async fn complete(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, TaskError> {
        Ok(self.mutate(task_id, |task| task.apply_completion(result, error)))
    }

    async fn cancel(&self, task_id: Uuid) -> Result<bool, TaskError> {
        Ok(self.mutate(task_id, |task| task.apply_cancel()))
    }

    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, TaskError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff))
        });
        let removed = (before - self.tasks.len()) as u64;
        if removed > 0 {
            info!(removed, "Cleaned up old task records");
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<TaskStats, TaskError> {
        let mut stats = TaskStats::default();
        for entry in self.tasks.iter() {
            stats.record(entry.status);
        }
        Ok(stats)
    }
}

/// Shared task store backed by the networked backend. Records live under
/// `{task_key_prefix}:{task_id}` as JSON with a retention TTL, so abandoned
/// records age out even if cleanup never runs.
pub struct RedisTaskStore {
    manager: ConnectionManager,
    breaker: CircuitBreaker,
    config: TaskConfig,
}

impl RedisTaskStore {
    pub async fn connect(
        url: &str,
        backend: &BackendConfig,
        config: &TaskConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, TaskError> {
        let client = redis::Client::open(url)
            .map_err(|e| TaskError::store_unavailable(format!("invalid backend url: {e}")))?;
        let manager = tokio::time::timeout(backend.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| TaskError::store_unavailable("connect timed out"))??;

        let mut conn = manager.clone();
        tokio::time::timeout(
            backend.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| TaskError::store_unavailable("ping timed out"))??;

        Ok(Self {
            manager,
            breaker: CircuitBreaker::new("task_store", breaker_config),
            config: config.clone(),
        })
    }

    fn task_key(&self, task_id: Uuid) -> String {
        format!("{}:{}", self.config.task_key_prefix, task_id)
    }

    async fn write_task(&self, task: &TaskInfo) -> Result<(), TaskError> {
        let key = self.task_key(task.task_id);
        let json = serde_json::to_string(task)?;
        let ttl = self.config.task_ttl.as_secs();
        self.breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.set_ex::<_, _, ()>(&key, &json, ttl)
                    .await
                    .map_err(TaskError::from)
            })
            .await
            .map_err(TaskError::from)
    }

    async fn read_task(&self, task_id: Uuid) -> Result<Option<TaskInfo>, TaskError> {
        let key = self.task_key(task_id);
        let raw: Option<String> = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.get(&key).await.map_err(TaskError::from)
            })
            .await
            .map_err(TaskError::from)?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Undecodable task record, dropping");
                    let _ = self
                        .breaker
                        .call(|| async {
                            let mut conn = self.manager.clone();
                            conn.del::<_, u64>(&key).await.map_err(TaskError::from)
                        })
                        .await;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    // Read-modify-write without a transaction. Concurrent writers can race,
    // but every write goes through the same transition rules, so a terminal
    // status is never replaced by a non-terminal one by a well-behaved
    // client.
    async fn mutate<F>(&self, task_id: Uuid, apply: F) -> Result<bool, TaskError>
    where
        F: FnOnce(&mut TaskInfo) -> bool + Send,
    {
        let Some(mut task) = self.read_task(task_id).await? else {
            return Ok(false);
        };
        if !apply(&mut task) {
            return Ok(false);
        }
        self.write_task(&task).await?;
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn insert(&self, task: TaskInfo) -> Result<(), TaskError> {
        debug!(task_id = %task.task_id, job_type = %task.job_type, "Recording task");
        self.write_task(&task).await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskInfo>, TaskError> {
        self.read_task(task_id).await
    }

    async fn mark_started(&self, task_id: Uuid) -> Result<bool, TaskError> {
        self.mutate(task_id, |task| {
            task.status == TaskStatus::Pending && task.apply_start()
        })
        .await
    }

    async fn update_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> Result<bool, TaskError> {
        self.mutate(task_id, |task| task.apply_progress(progress, status))
            .await
    }

    async fn complete(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, TaskError> {
        self.mutate(task_id, |task| task.apply_completion(result, error))
            .await
    }

    async fn cancel(&self, task_id: Uuid) -> Result<bool, TaskError> {
        self.mutate(task_id, |task| task.apply_cancel()).await
    }

    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, TaskError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let pattern = format!("{}:*", self.config.task_key_prefix);

        let removed = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                let keys: Vec<String> = conn.keys(&pattern).await.map_err(TaskError::from)?;

                let mut removed = 0u64;
                for key in keys {
                    let Some(json) = conn
                        .get::<_, Option<String>>(&key)
                        .await
                        .map_err(TaskError::from)?
                    else {
                        continue;
                    };
                    let stale = match serde_json::from_str::<TaskInfo>(&json) {
                        Ok(task) => {
                            task.status.is_terminal()
                                && task.completed_at.is_some_and(|at| at < cutoff)
                        }
                        Err(_) => true,
                    };
                    if stale {
                        conn.del::<_, u64>(&key).await.map_err(TaskError::from)?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
            .map_err(TaskError::from)?;

        if removed > 0 {
            info!(removed, "Cleaned up old task records");
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<TaskStats, TaskError> {
        let pattern = format!("{}:*", self.config.task_key_prefix);
        self.breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                let keys: Vec<String> = conn.keys(&pattern).await.map_err(TaskError::from)?;

                let mut stats = TaskStats::default();
                for key in keys {
                    let Some(json) = conn
                        .get::<_, Option<String>>(&key)
                        .await
                        .map_err(TaskError::from)?
                    else {
                        continue;
                    };
                    if let Ok(task) = serde_json::from_str::<TaskInfo>(&json) {
                        stats.record(task.status);
                    }
                }
                Ok(stats)
            })
            .await
            .map_err(TaskError::from)
    }
}
