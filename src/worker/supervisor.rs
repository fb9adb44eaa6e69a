//! Worker process supervisor.
//!
//! One supervisor owns one worker process. Worker settings are handed to the
//! process through environment variables; the worker command line itself is
//! deployment configuration. On Unix the worker gets its own process group
//! so termination signals reach the whole worker tree, not just the leader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::types::{WorkerInfo, WorkerSnapshot, WorkerStatus};
use crate::config::WorkerConfig;

/// Per-launch overrides for worker settings. `None` keeps whatever the
/// previous launch used (the configured defaults for the first one), so a
/// monitor-driven restart reuses the operator's last choices.
#[derive(Debug, Clone, Default)]
pub struct WorkerLaunchOptions {
    pub concurrency: Option<usize>,
    pub queues: Option<Vec<String>>,
    pub hostname: Option<String>,
    pub log_level: Option<String>,
}

/// Settings resolved for one spawn, captured before the state lock is
/// released.
struct LaunchSettings {
    concurrency: usize,
    queues: Vec<String>,
    hostname: String,
    log_level: String,
}

struct SupervisorState {
    info: WorkerInfo,
    log_level: String,
    child: Option<Child>,
}

struct SupervisorInner {
    config: WorkerConfig,
    state: Mutex<SupervisorState>,
    shutdown_tx: watch::Sender<bool>,
    monitor_running: AtomicBool,
}

#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let info = WorkerInfo::stopped(
            config.concurrency,
            config.queues.clone(),
            config.hostname.clone(),
        );
        let log_level = config.log_level.clone();
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                state: Mutex::new(SupervisorState {
                    info,
                    log_level,
                    child: None,
                }),
                shutdown_tx,
                monitor_running: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the worker process. Refuses while a worker is already starting,
    /// running, or mid-stop. Waits a short grace period after spawn and
    /// inspects the process to decide between `Running` and `Failed`.
    ///
    /// The state lock is only held for the bookkeeping steps; spawn, grace
    /// sleep, and status queries from other tasks all proceed unlocked.
    pub async fn start_worker(&self, options: WorkerLaunchOptions) -> bool {
        let launch = {
            let mut state = self.inner.state.lock().await;
            if state.info.status.is_active() || state.info.status == WorkerStatus::Stopping {
                warn!(status = %state.info.status, "Worker already active, refusing start");
                return false;
            }

            state.info.status = WorkerStatus::Starting;
            state.info.last_error = None;
            if let Some(concurrency) = options.concurrency {
                state.info.concurrency = concurrency;
            }
            if let Some(queues) = options.queues {
                state.info.queues = queues;
            }
            if let Some(hostname) = options.hostname {
                state.info.hostname = hostname;
            }
            if let Some(log_level) = options.log_level {
                state.log_level = log_level;
            }
            LaunchSettings {
                concurrency: state.info.concurrency,
                queues: state.info.queues.clone(),
                hostname: state.info.hostname.clone(),
                log_level: state.log_level.clone(),
            }
        };

        let mut child = match self.spawn_worker(&launch) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to spawn worker process");
                let mut state = self.inner.state.lock().await;
                state.info.status = WorkerStatus::Failed;
                state.info.last_error = Some(e.to_string());
                return false;
            }
        };

        let pid = child.id();
        {
            let mut state = self.inner.state.lock().await;
            state.info.pid = pid;
            state.info.started_at = Some(Utc::now());
            state.info.last_heartbeat = Some(Utc::now());
        }
        info!(pid = ?pid, command = %self.inner.config.worker_command.join(" "), "Worker process spawned");

        tokio::time::sleep(self.inner.config.startup_grace).await;

        let mut state = self.inner.state.lock().await;
        if state.info.status != WorkerStatus::Starting {
            // A concurrent stop claimed the worker during the grace period.
            info!(pid = ?pid, status = %state.info.status, "Start superseded, discarding spawned worker");
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return false;
        }

        match child.try_wait() {
            Ok(Some(exit)) => {
                error!(pid = ?pid, exit = %exit, "Worker died during startup grace period");
                state.info.status = WorkerStatus::Failed;
                state.info.pid = None;
                state.info.last_error = Some(format!("exited during startup: {exit}"));
                false
            }
            Err(e) => {
                error!(pid = ?pid, error = %e, "Could not inspect worker after spawn");
                state.info.status = WorkerStatus::Failed;
                state.info.pid = None;
                state.info.last_error = Some(e.to_string());
                false
            }
            Ok(None) => {
                state.info.status = WorkerStatus::Running;
                state.child = Some(child);
                info!(pid = ?pid, "Worker running");
                drop(state);
                self.ensure_monitor();
                true
            }
        }
    }

    fn spawn_worker(&self, launch: &LaunchSettings) -> std::io::Result<Child> {
        let argv = &self.inner.config.worker_command;
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker command")
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env(
                "CARDMAKER_WORKER_CONCURRENCY",
                launch.concurrency.to_string(),
            )
            .env("CARDMAKER_WORKER_QUEUES", launch.queues.join(","))
            .env("CARDMAKER_WORKER_HOSTNAME", &launch.hostname)
            .env("CARDMAKER_LOG_LEVEL", &launch.log_level)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Own process group so signals reach the worker's children too.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        command.spawn()
    }

    /// Stop the worker: graceful termination first, forced kill after
    /// `timeout`. Idempotent; returns `true` when no worker is active.
    /// Always leaves the record in `Stopped`.
    pub async fn stop_worker(&self, timeout: Duration) -> bool {
        // Claim the child under the lock, wait for it unlocked, then publish
        // the final state.
        let (child, pid) = {
            let mut state = self.inner.state.lock().await;
            if !state.info.status.is_active() && state.child.is_none() {
                debug!(status = %state.info.status, "No active worker to stop");
                return true;
            }
            state.info.status = WorkerStatus::Stopping;
            (state.child.take(), state.info.pid)
        };

        if let Some(mut child) = child {
            Self::signal_terminate(&mut child, pid);
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(exit)) => {
                    info!(pid = ?pid, exit = %exit, "Worker exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(pid = ?pid, error = %e, "Error waiting for worker exit");
                }
                Err(_) => {
                    warn!(pid = ?pid, timeout_secs = timeout.as_secs(), "Worker ignored graceful termination, killing");
                    Self::signal_kill(&mut child, pid);
                    if let Err(e) = child.wait().await {
                        warn!(pid = ?pid, error = %e, "Error reaping killed worker");
                    }
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        state.info.status = WorkerStatus::Stopped;
        state.info.pid = None;
        state.info.started_at = None;
        state.info.last_heartbeat = None;
        info!("Worker stopped");
        true
    }

    #[cfg(unix)]
    fn signal_terminate(_child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(child: &mut Child, _pid: Option<u32>) {
        let _ = child.start_kill();
    }

    #[cfg(unix)]
    fn signal_kill(_child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_kill(child: &mut Child, _pid: Option<u32>) {
        let _ = child.start_kill();
    }

    /// Stop, back off, start. Refuses once the restart budget is spent and
    /// marks the worker `Failed` so the condition is operator-visible.
    /// `restart_count` increments only on a successful start.
    pub async fn restart_worker(&self) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.info.restart_count >= self.inner.config.max_restarts {
                error!(
                    restart_count = state.info.restart_count,
                    max_restarts = self.inner.config.max_restarts,
                    "Restart budget exhausted, worker marked failed"
                );
                state.info.status = WorkerStatus::Failed;
                state.info.last_error = Some(format!(
                    "restart budget exhausted after {} attempts",
                    state.info.restart_count
                ));
                return false;
            }
        }

        self.stop_worker(self.inner.config.graceful_shutdown_timeout)
            .await;
        tokio::time::sleep(self.inner.config.restart_delay).await;

        if self.start_worker(WorkerLaunchOptions::default()).await {
            let mut state = self.inner.state.lock().await;
            state.info.restart_count += 1;
            info!(restart_count = state.info.restart_count, "Worker restarted");
            true
        } else {
            warn!("Worker restart attempt failed");
            false
        }
    }

    fn ensure_monitor(&self) {
        if self.inner.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let supervisor = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            debug!("Worker monitor started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(supervisor.inner.config.health_check_interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                supervisor.monitor_pass().await;
            }
            supervisor.inner.monitor_running.store(false, Ordering::SeqCst);
            debug!("Worker monitor stopped");
        });
    }

    /// One health-check pass. Restarts are spawned, never awaited here, so a
    /// slow stop/start sequence cannot wedge the monitor.
    async fn monitor_pass(&self) {
        let mut state = self.inner.state.lock().await;
        if state.info.status != WorkerStatus::Running {
            return;
        }

        let dead = match state.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(exit)) => Some(format!("process exited: {exit}")),
                Ok(None) => None,
                Err(e) => Some(format!("process unreachable: {e}")),
            },
            None => Some("process handle missing".to_string()),
        };

        if let Some(reason) = dead {
            warn!(pid = ?state.info.pid, reason = %reason, "Worker unhealthy, scheduling restart");
            state.info.last_error = Some(reason);
            state.child = None;
            state.info.pid = None;
            state.info.status = WorkerStatus::Stopped;
            drop(state);
            self.spawn_restart();
            return;
        }

        let now = Utc::now();
        let over_lifetime = state.info.started_at.is_some_and(|started| {
            (now - started).to_std().unwrap_or_default() > self.inner.config.max_lifetime
        });
        let heartbeat_stale = state.info.last_heartbeat.is_some_and(|beat| {
            (now - beat).to_std().unwrap_or_default() > self.inner.config.heartbeat_timeout
        });

        if over_lifetime {
            info!(pid = ?state.info.pid, "Worker exceeded max lifetime, recycling");
            drop(state);
            self.spawn_restart();
            return;
        }
        if heartbeat_stale {
            warn!(pid = ?state.info.pid, "Worker heartbeat stale, scheduling restart");
            drop(state);
            self.spawn_restart();
            return;
        }

        state.info.last_heartbeat = Some(now);
    }

    fn spawn_restart(&self) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.restart_worker().await;
        });
    }

    /// True only when the worker is running, the process is confirmed alive,
    /// and the heartbeat is fresh.
    pub async fn is_worker_healthy(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.info.status != WorkerStatus::Running {
            return false;
        }
        let alive = matches!(state.child.as_mut().map(|c| c.try_wait()), Some(Ok(None)));
        let fresh = state.info.last_heartbeat.is_some_and(|beat| {
            (Utc::now() - beat).to_std().unwrap_or_default()
                <= self.inner.config.heartbeat_timeout
        });
        alive && fresh
    }

    /// Snapshot of the worker record plus process resource usage.
    pub async fn get_worker_status(&self) -> WorkerSnapshot {
        let state = self.inner.state.lock().await;
        let info = state.info.clone();
        drop(state);

        let uptime_secs = info
            .started_at
            .map(|started| (Utc::now() - started).num_seconds().max(0) as u64);

        let (memory_bytes, cpu_percent) = match info.pid {
            Some(pid) => {
                let mut system = System::new();
                let pid = Pid::from_u32(pid);
                system.refresh_process(pid);
                match system.process(pid) {
                    Some(process) => (Some(process.memory()), Some(process.cpu_usage())),
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        WorkerSnapshot {
            info,
            uptime_secs,
            memory_bytes,
            cpu_percent,
        }
    }

    /// Stop the monitor loop and the worker. The host's lifecycle code calls
    /// this on shutdown.
    pub async fn cleanup(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.stop_worker(self.inner.config.graceful_shutdown_timeout)
            .await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn test_config(command: &[&str]) -> WorkerConfig {
        WorkerConfig {
            worker_command: command.iter().map(|s| s.to_string()).collect(),
            startup_grace: Duration::from_millis(100),
            restart_delay: Duration::from_millis(10),
            health_check_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(3600),
            graceful_shutdown_timeout: Duration::from_secs(2),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_and_graceful_stop() {
        let supervisor = WorkerSupervisor::new(test_config(&["sleep", "30"]));
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);

        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Running);
        assert!(snapshot.info.pid.is_some());
        assert!(supervisor.is_worker_healthy().await);

        assert!(supervisor.stop_worker(Duration::from_secs(2)).await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Stopped);
        assert!(snapshot.info.pid.is_none());
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn refuses_double_start() {
        let supervisor = WorkerSupervisor::new(test_config(&["sleep", "30"]));
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);
        assert!(!supervisor.start_worker(WorkerLaunchOptions::default()).await);
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_nothing_runs() {
        let supervisor = WorkerSupervisor::new(test_config(&["sleep", "30"]));
        assert!(supervisor.stop_worker(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn startup_failure_is_detected() {
        // Dies immediately, well inside the grace period.
        let supervisor = WorkerSupervisor::new(test_config(&["/bin/sh", "-c", "exit 3"]));
        assert!(!supervisor.start_worker(WorkerLaunchOptions::default()).await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Failed);
        assert!(snapshot.info.last_error.is_some());
    }

    #[tokio::test]
    async fn unspawnable_command_fails_start() {
        let supervisor =
            WorkerSupervisor::new(test_config(&["/nonexistent/cardmaker-worker-binary"]));
        assert!(!supervisor.start_worker(WorkerLaunchOptions::default()).await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Failed);
    }

    #[tokio::test]
    async fn sigterm_immune_worker_is_force_killed() {
        let supervisor = WorkerSupervisor::new(test_config(&[
            "/bin/sh",
            "-c",
            "trap '' TERM; while true; do sleep 1; done",
        ]));
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);

        let before = std::time::Instant::now();
        assert!(supervisor.stop_worker(Duration::from_millis(500)).await);
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(5));

        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Stopped);
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn restart_budget_is_enforced() {
        let config = WorkerConfig {
            max_restarts: 1,
            ..test_config(&["sleep", "30"])
        };
        let supervisor = WorkerSupervisor::new(config);
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);

        assert!(supervisor.restart_worker().await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.restart_count, 1);
        assert_eq!(snapshot.info.status, WorkerStatus::Running);

        // Budget of one is spent; the next restart is refused.
        assert!(!supervisor.restart_worker().await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Failed);
        assert_eq!(snapshot.info.restart_count, 1);

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn status_stays_responsive_during_startup_grace() {
        let config = WorkerConfig {
            startup_grace: Duration::from_millis(400),
            ..test_config(&["sleep", "30"])
        };
        let supervisor = WorkerSupervisor::new(config);

        let starter = supervisor.clone();
        let start = tokio::spawn(async move {
            starter.start_worker(WorkerLaunchOptions::default()).await
        });

        // While the start is sitting in its grace period, status queries
        // must answer promptly instead of queueing behind it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot =
            tokio::time::timeout(Duration::from_millis(200), supervisor.get_worker_status())
                .await
                .expect("status query blocked behind startup grace");
        assert_eq!(snapshot.info.status, WorkerStatus::Starting);

        assert!(start.await.unwrap());
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn launch_overrides_are_recorded_and_survive_restart() {
        let supervisor = WorkerSupervisor::new(test_config(&["sleep", "30"]));
        let options = WorkerLaunchOptions {
            concurrency: Some(4),
            queues: Some(vec!["fast".to_string()]),
            hostname: Some("worker@test".to_string()),
            log_level: Some("debug".to_string()),
        };
        assert!(supervisor.start_worker(options).await);

        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.concurrency, 4);
        assert_eq!(snapshot.info.queues, vec!["fast".to_string()]);
        assert_eq!(snapshot.info.hostname, "worker@test");

        // A restart without overrides reuses the previous launch settings.
        assert!(supervisor.restart_worker().await);
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.concurrency, 4);
        assert_eq!(snapshot.info.queues, vec!["fast".to_string()]);
        assert_eq!(snapshot.info.hostname, "worker@test");

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn crash_loop_exhausts_restart_budget() {
        // Outlives the 50ms grace, then dies. Every monitor-driven restart
        // repeats the cycle until the budget runs out.
        let config = WorkerConfig {
            max_restarts: 2,
            startup_grace: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(30),
            ..test_config(&["/bin/sh", "-c", "sleep 0.15"])
        };
        let supervisor = WorkerSupervisor::new(config);
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);

        let mut failed = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let snapshot = supervisor.get_worker_status().await;
            if snapshot.info.status == WorkerStatus::Failed {
                failed = true;
                break;
            }
        }
        assert!(failed, "crash loop never exhausted the restart budget");

        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.restart_count, 2);

        // The budget stays spent; no further attempt revives the worker.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = supervisor.get_worker_status().await;
        assert_eq!(snapshot.info.status, WorkerStatus::Failed);
        assert_eq!(snapshot.info.restart_count, 2);

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn monitor_restarts_dead_worker() {
        // Worker lives ~200ms; the monitor should notice and bring up a
        // replacement within its restart budget.
        let supervisor = WorkerSupervisor::new(test_config(&["/bin/sh", "-c", "sleep 0.2"]));
        assert!(supervisor.start_worker(WorkerLaunchOptions::default()).await);

        let mut restarted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let snapshot = supervisor.get_worker_status().await;
            if snapshot.info.restart_count >= 1 && snapshot.info.status == WorkerStatus::Running {
                restarted = true;
                break;
            }
        }
        assert!(restarted, "monitor never restarted the dead worker");
        supervisor.cleanup().await;
    }
}
