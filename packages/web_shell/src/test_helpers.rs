use async_trait::async_trait;
use pty_session::{Dimensions, OutputLog, OutputReader, ProcessHandle, PtyError, SessionLauncher};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-memory stand-in for a PTY process.
///
/// Records everything written to it and every resize, and lets the test push
/// output with [`FakeProcess::emit`] as if the shell had printed it.
pub struct FakeProcess {
    output: OutputLog,
    done: CancellationToken,
    size: Mutex<Dimensions>,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<Dimensions>>,
    scripted_errors: Mutex<VecDeque<PtyError>>,
    stall: AtomicBool,
    stalled_writes: AtomicUsize,
    closes: AtomicUsize,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self {
            output: OutputLog::new(256, 0),
            done: CancellationToken::new(),
            size: Mutex::new(Dimensions::default()),
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            scripted_errors: Mutex::new(VecDeque::new()),
            stall: AtomicBool::new(false),
            stalled_writes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl FakeProcess {
    pub fn emit(&self, data: &[u8]) {
        self.output.publish(data.to_vec());
    }

    /// The process exits on its own
    pub fn exit(&self) {
        self.done.cancel();
    }

    /// Every byte written so far, concatenated
    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().unwrap().concat()
    }

    pub fn resizes(&self) -> Vec<Dimensions> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self) -> usize {
        self.output.receiver_count()
    }

    /// Every later write blocks forever, like a process that stopped reading
    pub fn stall_writes(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// Writes currently blocked by [`FakeProcess::stall_writes`]
    pub fn stalled_writes(&self) -> usize {
        self.stalled_writes.load(Ordering::SeqCst)
    }

    /// Make the next write calls fail with these errors, in order
    pub fn fail_writes(&self, errors: impl IntoIterator<Item = PtyError>) {
        self.scripted_errors.lock().unwrap().extend(errors);
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.done.is_cancelled() {
            return Err(PtyError::Closed);
        }
        if self.stall.load(Ordering::SeqCst) {
            self.stalled_writes.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.scripted_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    async fn resize(&self, size: Dimensions) -> Result<(), PtyError> {
        let mut current = self.size.lock().unwrap();
        if *current != size {
            *current = size;
            self.resizes.lock().unwrap().push(size);
        }
        Ok(())
    }

    fn dimensions(&self) -> Dimensions {
        *self.size.lock().unwrap()
    }

    fn subscribe(&self) -> OutputReader {
        self.output.subscribe(self.done.clone())
    }

    async fn close(&self) -> Result<(), PtyError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.done.cancel();
        Ok(())
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// Launcher handing out [`FakeProcess`]es and counting calls.
#[derive(Default)]
pub struct CountingLauncher {
    delay: Duration,
    launches: AtomicUsize,
    destroys: AtomicUsize,
    failures: AtomicUsize,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl CountingLauncher {
    /// Every launch takes `delay`, widening the window for racing callers
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// The next `count` launches fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn last_process(&self) -> Option<Arc<FakeProcess>> {
        self.processes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionLauncher for CountingLauncher {
    async fn launch(&self, session: &str) -> Result<Arc<dyn ProcessHandle>, PtyError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PtyError::SpawnFailed {
                command: format!("fake-shell {session}"),
                message: "scripted failure".to_string(),
            });
        }

        let process = Arc::new(FakeProcess::default());
        self.processes.lock().unwrap().push(process.clone());
        Ok(process)
    }

    async fn destroy(&self, _session: &str) -> Result<(), PtyError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
