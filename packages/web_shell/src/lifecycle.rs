use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;

/// Liveness marker holding this process's id
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`, replacing a stale marker
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        debug!(path = %path.display(), "wrote pid file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removing a marker that is already gone is not an error.
    /// Returns whether a file was actually removed.
    pub fn remove(&self) -> io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The pid recorded at `path`, if that process is still alive
    pub fn running_pid(path: &Path) -> Option<u32> {
        let pid: u32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
        if pid == std::process::id() {
            return None;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal;
            use nix::unistd::Pid;
            // Signal 0 only checks existence
            if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
                return None;
            }
        }

        Some(pid)
    }
}

/// What a shutdown managed to do
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Bridges still running when the drain deadline passed
    pub abandoned_bridges: usize,
    pub sessions_closed: usize,
    pub session_failures: usize,
    /// Session teardown did not finish before the deadline
    pub sessions_timed_out: bool,
    pub pid_file_removed: bool,
    pub elapsed: Duration,
}

/// Owns everything that has to be stopped, in order, when the server exits.
pub struct Lifecycle {
    root: CancellationToken,
    accept: CancellationToken,
    bridges: TaskTracker,
    registry: Arc<SessionRegistry>,
    pid_file: Mutex<Option<PidFile>>,
}

impl Lifecycle {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            root: CancellationToken::new(),
            accept: CancellationToken::new(),
            bridges: TaskTracker::new(),
            registry,
            pid_file: Mutex::new(None),
        }
    }

    pub fn set_pid_file(&self, pid_file: PidFile) {
        *self.lock_pid_file() = Some(pid_file);
    }

    fn lock_pid_file(&self) -> std::sync::MutexGuard<'_, Option<PidFile>> {
        self.pid_file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves when the listener should stop accepting. Hand this to
    /// `axum::serve(..).with_graceful_shutdown`.
    pub fn accept_stopped(&self) -> WaitForCancellationFutureOwned {
        self.accept.clone().cancelled_owned()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.accept.is_cancelled()
    }

    /// Cancellation token for a new bridge, fired on shutdown
    pub fn bridge_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Count a bridge as in flight until `bridge` completes
    pub fn track<F: Future>(&self, bridge: F) -> TrackedFuture<F> {
        self.bridges.track_future(bridge)
    }

    pub fn active_connections(&self) -> usize {
        self.bridges.len()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Graceful, best-effort shutdown bounded by `timeout`.
    ///
    /// Steps run in order and a failing step never stops the next one:
    /// stop accepting, cancel bridges, wait for bridges (up to half the
    /// budget), tear down sessions (up to the full budget), remove the pid
    /// file.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        let drain_deadline = started + timeout / 2;
        let mut report = ShutdownReport::default();

        info!(?timeout, connections = self.active_connections(), "shutting down");

        // 1. stop accepting
        self.accept.cancel();

        // 2. signal every bridge
        self.root.cancel();
        self.bridges.close();

        // 3. wait for bridges to finish
        if timeout_at(drain_deadline, self.bridges.wait()).await.is_err() {
            report.abandoned_bridges = self.bridges.len();
            warn!(
                remaining = report.abandoned_bridges,
                "bridges did not finish in time, continuing"
            );
        } else {
            debug!("all bridges finished");
        }

        // 4. tear down sessions
        match timeout_at(deadline, self.registry.shutdown_all()).await {
            Ok(summary) => {
                report.sessions_closed = summary.closed;
                report.session_failures = summary.failed;
            }
            Err(_) => {
                report.sessions_timed_out = true;
                warn!("session teardown did not finish in time, continuing");
            }
        }

        // 5. remove liveness marker
        if let Some(pid_file) = self.lock_pid_file().take() {
            match pid_file.remove() {
                Ok(removed) => report.pid_file_removed = removed,
                Err(e) => warn!(path = %pid_file.path().display(), error = %e, "failed to remove pid file"),
            }
        }

        report.elapsed = started.elapsed();
        info!(
            elapsed = ?report.elapsed,
            sessions = report.sessions_closed,
            abandoned = report.abandoned_bridges,
            "shutdown complete"
        );
        report
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere) with the signal's name
pub async fn termination_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => Ok("SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
