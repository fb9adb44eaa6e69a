//! Queue consumer loop.
//!
//! Runs inside the worker process: pops jobs off the broker and executes
//! them through the task manager, up to a configured number of concurrent
//! jobs. Shutdown is cooperative through a watch channel; in-flight jobs are
//! drained before the loop returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::tasks::{BrokerClient, TaskManager};

/// How long one pop blocks before re-checking the shutdown signal.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Pause after a broker error so a dead backend is not hammered.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct QueueConsumer {
    manager: TaskManager,
    broker: Arc<BrokerClient>,
    queues: Vec<String>,
    concurrency: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueConsumer {
    pub fn new(
        manager: TaskManager,
        broker: Arc<BrokerClient>,
        queues: Vec<String>,
        concurrency: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            broker,
            queues,
            concurrency: concurrency.max(1),
            shutdown_rx,
        }
    }

    /// Consume until shutdown is signalled, then drain in-flight jobs.
    pub async fn run(mut self) {
        info!(
            queues = ?self.queues,
            concurrency = self.concurrency,
            "Queue consumer started"
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    drop(permit);
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                popped = self.broker.pop(&self.queues, POLL_INTERVAL) => match popped {
                    Ok(Some(message)) => {
                        let manager = self.manager.clone();
                        tokio::spawn(async move {
                            let task_id = message.task_id;
                            if let Err(e) = manager.execute_enqueued(message).await {
                                error!(task_id = %task_id, error = %e, "Job execution failed");
                            }
                            drop(permit);
                        });
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        warn!(error = %e, "Broker pop failed, backing off");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
        }

        // Wait for every in-flight job to hand its permit back.
        debug!("Queue consumer draining in-flight jobs");
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("Queue consumer stopped");
    }
}
