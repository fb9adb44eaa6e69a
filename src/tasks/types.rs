//! Task record types and lifecycle transitions.
//!
//! All transition logic lives on [`TaskInfo`] so the memory and networked
//! stores share identical semantics. Terminal states are sticky: once a task
//! is succeeded, failed, or cancelled, later transition attempts are refused
//! rather than applied.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and recorded, not yet picked up.
    Pending,
    /// A worker (or local executor) is running the job.
    Running,
    /// Completed with a result payload.
    Success,
    /// Completed with an error.
    Failure,
    /// Cancelled before completion; the strongest terminal state.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Scheduling priority carried on the task record. The broker queues are
/// FIFO; priority is advisory metadata for operators and future routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Complete record for one background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: Uuid,
    pub job_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion percentage in `[0.0, 100.0]`.
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Reserved for retry bookkeeping once automatic retries land; always
    /// zero today, but persisted so stored records keep their shape.
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: TaskPriority,
    /// Originating caller, when known (session id, service name).
    pub created_by: Option<String>,
    pub payload: HashMap<String, serde_json::Value>,
}

impl TaskInfo {
    pub fn new(
        job_type: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
        max_retries: u32,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            job_type: job_type.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            priority: TaskPriority::Normal,
            created_by: None,
            payload,
        }
    }

    /// Mark the task running. Refused once terminal.
    pub fn apply_start(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Record a progress update, clamped to `[0.0, 100.0]`, optionally with
    /// a status change. Terminal tasks ignore late progress from
    /// still-running executors. Entering `Running` stamps `started_at` once;
    /// entering a terminal status stamps `completed_at`.
    pub fn apply_progress(&mut self, progress: f64, status: Option<TaskStatus>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.progress = progress.clamp(0.0, 100.0);
        if let Some(status) = status {
            self.status = status;
            match status {
                TaskStatus::Running if self.started_at.is_none() => {
                    self.started_at = Some(Utc::now());
                }
                s if s.is_terminal() => {
                    self.completed_at = Some(Utc::now());
                }
                _ => {}
            }
        }
        true
    }

    /// Record completion. A cancelled task stays cancelled even when its
    /// executor finishes afterwards.
    pub fn apply_completion(
        &mut self,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = match error.as_deref() {
            Some(e) if !e.is_empty() => TaskStatus::Failure,
            _ => TaskStatus::Success,
        };
        self.progress = 100.0;
        self.result = result;
        self.error = error.filter(|e| !e.is_empty());
        self.completed_at = Some(Utc::now());
        true
    }

    /// Cancel the task. Only pending and running tasks can be cancelled.
    pub fn apply_cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Aggregate counts over the task store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failure: u64,
    pub cancelled: u64,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Success => self.success += 1,
            TaskStatus::Failure => self.failure += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}
