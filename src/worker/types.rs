//! Worker process state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the supervised worker process.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Failed`
/// reachable from `Starting` (launch died inside the grace period) or from
/// `Running` (process death after the restart budget is spent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl WorkerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Mutable record the supervisor maintains about its worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Last time the monitor confirmed the process alive.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub hostname: String,
}

impl WorkerInfo {
    pub fn stopped(concurrency: usize, queues: Vec<String>, hostname: String) -> Self {
        Self {
            pid: None,
            status: WorkerStatus::Stopped,
            started_at: None,
            last_heartbeat: None,
            restart_count: 0,
            last_error: None,
            concurrency,
            queues,
            hostname,
        }
    }
}

/// Point-in-time view of the worker, with resource usage when the process is
/// alive and inspectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    #[serde(flatten)]
    pub info: WorkerInfo,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_activity() {
        assert!(WorkerStatus::Running.is_active());
        assert!(WorkerStatus::Starting.is_active());
        assert!(!WorkerStatus::Stopped.is_active());
        assert!(!WorkerStatus::Failed.is_active());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Stopping).unwrap(),
            "\"stopping\""
        );
        assert_eq!(WorkerStatus::Failed.to_string(), "failed");
    }
}
