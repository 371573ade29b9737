//! Lifecycle management for the extraction worker process.
//!
//! The supervisor tracks at most one worker. [`WorkerSupervisor::ensure_running`] starts a
//! worker lazily and restarts it after it exits; [`WorkerSupervisor::terminate`] stops it with a
//! termination signal, escalating to a forced kill after a bounded wait. Both operations are
//! serialized by a single async mutex, while the current [`WorkerStatus`] is published on a
//! watch channel so readers never contend for that lock.
//!
//! A freshly launched worker is considered healthy once it survives the startup grace period.
//! This is optimistic: a slow worker may still be binding its port when callers start using it.

use crate::metrics::GatewayMetrics;
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;

/// Errors raised while starting the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker executable could not be spawned.
    #[error("Failed to launch worker `{program}`: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },
    /// The worker exited before the startup grace period elapsed.
    #[error("Worker exited during startup: {0}")]
    ExitedDuringStartup(String),
}

/// Observable lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No worker has been launched yet.
    NotStarted,
    /// A worker was launched and is inside its startup grace period.
    Starting,
    /// A worker survived its grace period and has not been seen exiting.
    Running,
    /// The last tracked worker is gone.
    Exited,
}

/// How [`WorkerSupervisor::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No worker was tracked.
    NotRunning,
    /// The tracked worker had already exited; nothing was signalled.
    AlreadyExited,
    /// The worker exited after the termination signal.
    Graceful,
    /// The worker had to be killed.
    Killed,
}

/// Program and arguments used to launch the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Start describing a worker launched from `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a command-line argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Tika server invocation: `<java> -jar <jar> -h localhost -p <port>`.
    pub fn tika(java: &Path, jar: &Path, port: u16) -> Self {
        Self::new(java)
            .arg("-jar")
            .arg(jar)
            .arg("-h")
            .arg("localhost")
            .arg("-p")
            .arg(port.to_string())
    }

    /// Program that will be executed.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// How long a new worker may take to fail before it is assumed to be running.
    pub startup_grace: Duration,
    /// How long to wait after the termination signal before killing the worker.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

type ExitOutcome = std::io::Result<ExitStatus>;

/// Handle to a launched worker. The child itself is owned by its watcher task.
struct Worker {
    pid: Option<u32>,
    exit_rx: oneshot::Receiver<ExitOutcome>,
    kill_tx: Option<oneshot::Sender<()>>,
}

enum WorkerState {
    NotStarted,
    Starting(Worker),
    Running(Worker),
    Exited,
}

impl WorkerState {
    fn worker_mut(&mut self) -> Option<&mut Worker> {
        match self {
            Self::Starting(worker) | Self::Running(worker) => Some(worker),
            Self::NotStarted | Self::Exited => None,
        }
    }

    fn take_worker(&mut self) -> Option<Worker> {
        match std::mem::replace(self, Self::Exited) {
            Self::Starting(worker) | Self::Running(worker) => Some(worker),
            Self::NotStarted => {
                *self = Self::NotStarted;
                None
            }
            Self::Exited => None,
        }
    }

    /// Move `Starting` to `Running`; returns whether anything changed.
    fn promote(&mut self) -> bool {
        let (next, promoted) = match std::mem::replace(self, Self::Exited) {
            Self::Starting(worker) => (Self::Running(worker), true),
            other => (other, false),
        };
        *self = next;
        promoted
    }
}

/// Owns the worker process and its lifecycle transitions.
pub struct WorkerSupervisor {
    command: WorkerCommand,
    settings: SupervisorSettings,
    state: Mutex<WorkerState>,
    status_tx: Arc<watch::Sender<WorkerStatus>>,
    activity: Notify,
    metrics: Arc<GatewayMetrics>,
}

impl WorkerSupervisor {
    /// Create a supervisor that has not launched anything yet.
    pub fn new(
        command: WorkerCommand,
        settings: SupervisorSettings,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (status_tx, _) = watch::channel(WorkerStatus::NotStarted);
        Self {
            command,
            settings,
            state: Mutex::new(WorkerState::NotStarted),
            status_tx: Arc::new(status_tx),
            activity: Notify::new(),
            metrics,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    /// Make sure a worker is running, launching one if none is tracked or the last one exited.
    ///
    /// Returns immediately when the tracked worker has not reported an exit. Otherwise a new
    /// worker is launched and given the startup grace period; an exit inside that window is
    /// returned as the error, and surviving it counts as success.
    pub async fn ensure_running(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;

        let tracked = state
            .worker_mut()
            .map(|worker| (worker.pid, worker.exit_rx.try_recv()));
        match tracked {
            Some((_, Err(TryRecvError::Empty))) => {
                // a caller cancelled mid-grace left the worker in `Starting`
                if state.promote() {
                    self.mark_running();
                }
                return Ok(());
            }
            Some((pid, Ok(outcome))) => {
                tracing::error!(pid, outcome = %describe_exit(&outcome), "Worker stopped");
            }
            Some((pid, Err(TryRecvError::Closed))) => {
                tracing::error!(pid, "Worker watcher ended without reporting an exit");
            }
            None => {}
        }

        *state = WorkerState::Exited;
        self.publish(WorkerStatus::Starting);
        let worker = match self.launch() {
            Ok(worker) => worker,
            Err(err) => {
                self.publish(WorkerStatus::Exited);
                return Err(err);
            }
        };
        let pid = worker.pid;
        *state = WorkerState::Starting(worker);

        let early_exit = match state.worker_mut() {
            Some(worker) => tokio::time::timeout(self.settings.startup_grace, &mut worker.exit_rx)
                .await
                .ok(),
            None => None,
        };

        match early_exit {
            Some(outcome) => {
                *state = WorkerState::Exited;
                self.publish(WorkerStatus::Exited);
                let reason = match outcome {
                    Ok(outcome) => describe_exit(&outcome),
                    Err(_) => "watcher ended without reporting".to_string(),
                };
                tracing::error!(pid, reason = %reason, "Worker failed during startup");
                Err(WorkerError::ExitedDuringStartup(reason))
            }
            None => {
                if state.promote() {
                    self.mark_running();
                }
                tracing::info!(pid, "Worker started");
                self.activity.notify_one();
                Ok(())
            }
        }
    }

    /// Stop the tracked worker, if any.
    ///
    /// The handle is detached first, then the worker receives a termination signal. If it has
    /// not exited within the shutdown timeout it is killed. Returns once the exit is observed.
    /// A worker whose exit was already reported is never signalled, since its pid may have
    /// been reused.
    pub async fn terminate(&self) -> Termination {
        let mut state = self.state.lock().await;
        let Some(mut worker) = state.take_worker() else {
            return Termination::NotRunning;
        };
        let pid = worker.pid;

        match worker.exit_rx.try_recv() {
            // the watcher publishes the exit just before reporting it
            Err(TryRecvError::Empty) if self.status() != WorkerStatus::Exited => {}
            Err(TryRecvError::Empty) => {
                tracing::info!(pid, "Worker already exited");
                self.publish(WorkerStatus::Exited);
                return Termination::AlreadyExited;
            }
            Ok(outcome) => {
                tracing::info!(pid, outcome = %describe_exit(&outcome), "Worker already exited");
                self.publish(WorkerStatus::Exited);
                return Termination::AlreadyExited;
            }
            Err(TryRecvError::Closed) => {
                tracing::warn!(pid, "Worker watcher ended without reporting an exit");
                self.publish(WorkerStatus::Exited);
                return Termination::AlreadyExited;
            }
        }
        tracing::info!(pid, "Terminating worker");

        if request_graceful_exit(pid) {
            match tokio::time::timeout(self.settings.shutdown_timeout, &mut worker.exit_rx).await {
                Ok(outcome) => {
                    if let Ok(outcome) = outcome {
                        tracing::info!(pid, outcome = %describe_exit(&outcome), "Worker terminated");
                    }
                    self.publish(WorkerStatus::Exited);
                    return Termination::Graceful;
                }
                Err(_) => {
                    tracing::warn!(
                        pid,
                        timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                        "Worker ignored termination signal; killing"
                    );
                }
            }
        }

        if let Some(kill) = worker.kill_tx.take() {
            let _ = kill.send(());
        }
        if let Ok(outcome) = (&mut worker.exit_rx).await {
            tracing::info!(pid, outcome = %describe_exit(&outcome), "Worker killed");
        }
        self.publish(WorkerStatus::Exited);
        Termination::Killed
    }

    /// Note a successful extraction, resetting the idle timer.
    pub fn record_activity(&self) {
        self.activity.notify_one();
    }

    /// Stop the worker whenever `idle` elapses without [`Self::record_activity`].
    ///
    /// Every successful launch arms the timer, so a worker that never serves a request is
    /// stopped too. After a shutdown the timer stays idle until the next launch.
    pub fn spawn_idle_reaper(self: &Arc<Self>, idle: Duration) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                supervisor.activity.notified().await;
                while tokio::time::timeout(idle, supervisor.activity.notified())
                    .await
                    .is_ok()
                {}
                if supervisor.status() == WorkerStatus::Exited {
                    continue;
                }
                tracing::info!(idle_ms = idle.as_millis() as u64, "Worker idle; stopping");
                supervisor.terminate().await;
            }
        })
    }

    fn launch(&self) -> Result<Worker, WorkerError> {
        tracing::info!(command = %self.command, "Starting worker");
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Launch {
                program: self.command.program.display().to_string(),
                source,
            })?;
        self.metrics.record_launch();

        let pid = child.id();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let status_tx = Arc::clone(&self.status_tx);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = child.wait() => outcome,
                Ok(()) = &mut kill_rx => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(pid, error = %err, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };
            tracing::info!(pid, outcome = %describe_exit(&outcome), "Worker ended");
            // publish before reporting so a restart triggered by the report is never overwritten
            status_tx.send_replace(WorkerStatus::Exited);
            let _ = exit_tx.send(outcome);
        });

        Ok(Worker {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    fn publish(&self, status: WorkerStatus) {
        self.status_tx.send_replace(status);
    }

    /// `Starting -> Running`, unless the watcher already reported the exit.
    fn mark_running(&self) {
        self.status_tx.send_if_modified(|status| {
            if *status == WorkerStatus::Starting {
                *status = WorkerStatus::Running;
                true
            } else {
                false
            }
        });
    }
}

fn describe_exit(outcome: &ExitOutcome) -> String {
    match outcome {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    }
}

/// Send SIGTERM to `pid`. Returns `false` when no signal could be delivered.
#[cfg(unix)]
fn request_graceful_exit(pid: Option<u32>) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(pid = raw, error = %err, "Failed to signal worker");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: Option<u32>) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn supervisor(command: WorkerCommand, settings: SupervisorSettings) -> Arc<WorkerSupervisor> {
        Arc::new(WorkerSupervisor::new(
            command,
            settings,
            Arc::new(GatewayMetrics::new()),
        ))
    }

    fn sleeper() -> WorkerCommand {
        WorkerCommand::new("sleep").arg("30")
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn tika_command_line() {
        let command = WorkerCommand::tika(
            Path::new("/usr/bin/java"),
            Path::new("/opt/tika-server.jar"),
            9998,
        );
        assert_eq!(
            command.to_string(),
            "/usr/bin/java -jar /opt/tika-server.jar -h localhost -p 9998"
        );
        assert_eq!(command.program(), Path::new("/usr/bin/java"));
    }

    #[tokio::test]
    async fn terminate_without_worker_is_a_no_op() {
        let supervisor = supervisor(sleeper(), SupervisorSettings::default());
        assert_eq!(supervisor.terminate().await, Termination::NotRunning);
        assert_eq!(supervisor.status(), WorkerStatus::NotStarted);
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_launch() {
        let supervisor = supervisor(sleeper(), SupervisorSettings::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let supervisor = Arc::clone(&supervisor);
            handles.push(tokio::spawn(async move { supervisor.ensure_running().await }));
        }
        for handle in handles {
            handle.await.expect("task").expect("worker running");
        }

        assert_eq!(supervisor.metrics.snapshot().worker_launches, 1);
        assert_eq!(supervisor.status(), WorkerStatus::Running);

        supervisor.ensure_running().await.expect("still running");
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 1);

        supervisor.terminate().await;
        assert_eq!(supervisor.status(), WorkerStatus::Exited);
    }

    #[tokio::test]
    async fn exit_inside_grace_period_is_reported() {
        let settings = SupervisorSettings {
            startup_grace: Duration::from_millis(500),
            ..SupervisorSettings::default()
        };
        let supervisor = supervisor(WorkerCommand::new("false"), settings);

        let err = supervisor
            .ensure_running()
            .await
            .expect_err("worker exits immediately");
        assert!(matches!(err, WorkerError::ExitedDuringStartup(_)));
        assert_eq!(supervisor.status(), WorkerStatus::Exited);

        let _ = supervisor.ensure_running().await;
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 2);
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let supervisor = supervisor(
            WorkerCommand::new("/nonexistent/tikagate-worker"),
            SupervisorSettings::default(),
        );
        let err = supervisor
            .ensure_running()
            .await
            .expect_err("spawn fails");
        assert!(matches!(err, WorkerError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/tikagate-worker"));
        assert_eq!(supervisor.status(), WorkerStatus::Exited);
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 0);
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted_on_next_call() {
        let settings = SupervisorSettings {
            startup_grace: Duration::from_millis(50),
            ..SupervisorSettings::default()
        };
        let supervisor = supervisor(shell("sleep 0.3"), settings);
        let mut status = supervisor.subscribe();

        supervisor.ensure_running().await.expect("assumed running");
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == WorkerStatus::Exited),
        )
        .await
        .expect("exit observed in time")
        .expect("status channel open");

        supervisor.ensure_running().await.expect("restarted");
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 2);
        supervisor.terminate().await;
    }

    #[tokio::test]
    async fn terminate_is_graceful_for_cooperative_workers() {
        let supervisor = supervisor(sleeper(), SupervisorSettings::default());
        supervisor.ensure_running().await.expect("running");

        let started = Instant::now();
        assert_eq!(supervisor.terminate().await, Termination::Graceful);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(supervisor.status(), WorkerStatus::Exited);

        assert_eq!(supervisor.terminate().await, Termination::NotRunning);
        assert_eq!(supervisor.status(), WorkerStatus::Exited);
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let settings = SupervisorSettings {
            startup_grace: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(300),
        };
        let supervisor = supervisor(shell("trap '' TERM; sleep 30"), settings);
        supervisor.ensure_running().await.expect("running");

        let started = Instant::now();
        assert_eq!(supervisor.terminate().await, Termination::Killed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "waited {elapsed:?}");
        assert_eq!(supervisor.status(), WorkerStatus::Exited);
    }

    #[tokio::test]
    async fn exited_worker_is_not_signalled_on_terminate() {
        let settings = SupervisorSettings {
            startup_grace: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        };
        let supervisor = supervisor(shell("sleep 0.2"), settings);
        let mut status = supervisor.subscribe();

        supervisor.ensure_running().await.expect("assumed running");
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == WorkerStatus::Exited),
        )
        .await
        .expect("exit observed in time")
        .expect("status channel open");

        let started = Instant::now();
        assert_eq!(supervisor.terminate().await, Termination::AlreadyExited);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(supervisor.status(), WorkerStatus::Exited);
        assert_eq!(supervisor.terminate().await, Termination::NotRunning);
    }

    #[tokio::test]
    async fn idle_timer_arms_on_launch_without_activity() {
        let supervisor = supervisor(sleeper(), SupervisorSettings::default());
        let reaper = supervisor.spawn_idle_reaper(Duration::from_millis(200));

        supervisor.ensure_running().await.expect("running");

        let mut status = supervisor.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == WorkerStatus::Exited),
        )
        .await
        .expect("idle shutdown in time")
        .expect("status channel open");
        assert_eq!(supervisor.terminate().await, Termination::NotRunning);

        reaper.abort();
    }

    #[tokio::test]
    async fn idle_worker_is_stopped_and_restarted_lazily() {
        let supervisor = supervisor(sleeper(), SupervisorSettings::default());
        let reaper = supervisor.spawn_idle_reaper(Duration::from_millis(200));

        supervisor.ensure_running().await.expect("running");
        supervisor.record_activity();

        let mut status = supervisor.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == WorkerStatus::Exited),
        )
        .await
        .expect("idle shutdown in time")
        .expect("status channel open");

        supervisor.ensure_running().await.expect("restarted");
        assert_eq!(supervisor.metrics.snapshot().worker_launches, 2);

        reaper.abort();
        supervisor.terminate().await;
    }
}
