//! Queue broker client.
//!
//! Jobs travel as JSON messages over backend lists, one list per queue under
//! `{queue_prefix}:{queue}`. Producers push with `LPUSH`; consumers block on
//! `BRPOP` across their subscribed queues. Pushes share the multiplexed
//! connection; blocking pops get a dedicated connection so they cannot stall
//! unrelated traffic.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::TaskError;
use crate::config::{BackendConfig, TaskConfig};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

/// Wire format for one enqueued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub task_id: Uuid,
    pub job_type: String,
    pub payload: HashMap<String, serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(
        task_id: Uuid,
        job_type: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            task_id,
            job_type: job_type.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

pub struct BrokerClient {
    manager: ConnectionManager,
    /// Dedicated connection for blocking pops.
    pop_conn: Mutex<MultiplexedConnection>,
    breaker: CircuitBreaker,
    queue_prefix: String,
}

impl BrokerClient {
    pub async fn connect(
        url: &str,
        backend: &BackendConfig,
        config: &TaskConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, TaskError> {
        let client = redis::Client::open(url)
            .map_err(|e| TaskError::broker_unavailable(format!("invalid broker url: {e}")))?;
        let manager =
            tokio::time::timeout(backend.connect_timeout, ConnectionManager::new(client.clone()))
                .await
                .map_err(|_| TaskError::broker_unavailable("connect timed out"))??;
        let pop_conn = tokio::time::timeout(
            backend.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| TaskError::broker_unavailable("connect timed out"))??;

        let mut conn = manager.clone();
        tokio::time::timeout(
            backend.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| TaskError::broker_unavailable("ping timed out"))??;

        Ok(Self {
            manager,
            pop_conn: Mutex::new(pop_conn),
            breaker: CircuitBreaker::new("task_broker", breaker_config),
            queue_prefix: config.queue_prefix.clone(),
        })
    }

    /// Queues are addressed by job type, so adding a job type needs no
    /// routing table: workers just subscribe to the matching queue name.
    pub fn queue_key(&self, queue: &str) -> String {
        format!("{}:{}", self.queue_prefix, queue)
    }

    pub async fn enqueue(&self, queue: &str, message: &JobMessage) -> Result<(), TaskError> {
        let key = self.queue_key(queue);
        let json = serde_json::to_string(message)?;
        self.breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.lpush::<_, _, ()>(&key, &json)
                    .await
                    .map_err(TaskError::from)
            })
            .await
            .map_err(TaskError::from)?;

        debug!(task_id = %message.task_id, queue = %key, "Enqueued job");
        Ok(())
    }

    /// Block up to `timeout` waiting for a job on any of the given queues.
    /// Returns `Ok(None)` when the wait times out, which is the consumer's
    /// normal idle path. Undecodable messages are dropped with a warning
    /// rather than wedging the queue.
    pub async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<JobMessage>, TaskError> {
        let keys: Vec<String> = queues.iter().map(|q| self.queue_key(q)).collect();
        let timeout_secs = timeout.as_secs().max(1);

        let popped: Option<(String, String)> = self
            .breaker
            .call(|| async {
                let mut conn = self.pop_conn.lock().await;
                redis::cmd("BRPOP")
                    .arg(&keys)
                    .arg(timeout_secs)
                    .query_async(&mut *conn)
                    .await
                    .map_err(TaskError::from)
            })
            .await
            .map_err(TaskError::from)?;

        let Some((queue, json)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str::<JobMessage>(&json) {
            Ok(message) => {
                debug!(task_id = %message.task_id, queue = %queue, "Dequeued job");
                Ok(Some(message))
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Dropping undecodable job message");
                Ok(None)
            }
        }
    }

    /// Number of jobs waiting on a queue.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, TaskError> {
        let key = self.queue_key(queue);
        self.breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.llen(&key).await.map_err(TaskError::from)
            })
            .await
            .map_err(TaskError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_as_json() {
        let mut payload = HashMap::new();
        payload.insert("deck".to_string(), serde_json::json!("standard"));
        let message = JobMessage::new(Uuid::new_v4(), "pdf_generation", payload);

        let json = serde_json::to_string(&message).unwrap();
        let decoded: JobMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.task_id, message.task_id);
        assert_eq!(decoded.job_type, "pdf_generation");
        assert_eq!(decoded.payload["deck"], serde_json::json!("standard"));
    }
}
