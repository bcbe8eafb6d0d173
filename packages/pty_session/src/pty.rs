use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PtyError;
use crate::handle::{Dimensions, ProcessHandle};
use crate::output::{OutputLog, OutputReader};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const MAILBOX_CAPACITY: usize = 32;
/// How long a child gets to exit after SIGHUP before it is killed outright
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub size: Dimensions,
    /// Size of the buffer the reader thread fills per read call
    pub read_buffer: usize,
    /// Bytes of recent output replayed to each new subscriber
    pub replay_bytes: usize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            size: Dimensions::default(),
            read_buffer: 8192,
            replay_bytes: 64 * 1024,
        }
    }
}

fn pty_size(size: Dimensions) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn build_command(config: &PtyConfig) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&config.command);
    for arg in &config.args {
        cmd.arg(arg);
    }

    if let Some(dir) = &config.working_dir {
        debug!(dir = %dir, "setting working directory");
        cmd.cwd(dir);
    }

    // Full-color terminal capability for whatever runs inside
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    // tmux refuses to start nested inside another tmux client
    cmd.env_remove("TMUX");

    for key in ["PATH", "HOME", "USER", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    cmd
}

/// Kill and reap a child whose launch is being rolled back
fn abandon_child(child: &mut Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill during rollback failed");
    }
    if let Err(e) = child.wait() {
        debug!(error = %e, "reaping rolled back child failed");
    }
}

struct WriteRequest {
    data: Vec<u8>,
    respond_to: oneshot::Sender<Result<usize, PtyError>>,
}

enum PtyMessage {
    Resize {
        size: Dimensions,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to a PTY-backed child process.
///
/// Reads and writes each run on their own thread so a process that stops
/// draining its input never holds up its output, and neither blocks the async
/// runtime. Resize and teardown go through the actor task that owns the PTY
/// master and the child.
#[derive(Clone)]
pub struct PtyHandle {
    input: mpsc::Sender<WriteRequest>,
    control: mpsc::Sender<PtyMessage>,
    output: Arc<OutputLog>,
    size: watch::Receiver<Dimensions>,
    done: CancellationToken,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Open a PTY, start `config.command` inside it and apply the initial size.
    ///
    /// Nothing is left behind on failure: the PTY pair is released and a child
    /// that did start is terminated before the error is returned.
    pub fn spawn(config: PtyConfig) -> Result<Self, PtyError> {
        PtyActor::spawn(config)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PtyError>>) -> PtyMessage,
    ) -> Result<T, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(build(tx))
            .await
            .map_err(|_| PtyError::Closed)?;
        rx.await.map_err(|_| PtyError::Closed)?
    }
}

#[async_trait]
impl ProcessHandle for PtyHandle {
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.done.is_cancelled() {
            return Err(PtyError::Closed);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let (tx, rx) = oneshot::channel();
        self.input
            .send(WriteRequest {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::Closed)?;
        rx.await.map_err(|_| PtyError::Closed)?
    }

    async fn resize(&self, size: Dimensions) -> Result<(), PtyError> {
        if *self.size.borrow() == size {
            return Ok(());
        }
        self.request(|respond_to| PtyMessage::Resize { size, respond_to })
            .await
    }

    fn dimensions(&self) -> Dimensions {
        *self.size.borrow()
    }

    fn subscribe(&self) -> OutputReader {
        self.output.subscribe(self.done.clone())
    }

    async fn close(&self) -> Result<(), PtyError> {
        match self
            .request(|respond_to| PtyMessage::Close { respond_to })
            .await
        {
            // Actor already gone: the process was closed or exited before
            Err(PtyError::Closed) => Ok(()),
            other => other,
        }
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Owns the PTY master and the child process for the lifetime of a session
struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    command: String,
    size_tx: watch::Sender<Dimensions>,
    done: CancellationToken,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    fn spawn(config: PtyConfig) -> Result<PtyHandle, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(config.size))
            .map_err(|e| PtyError::OpenFailed(format!("{e:#}")))?;

        let cmd = build_command(&config);
        info!(
            command = %config.command,
            args = ?config.args,
            "spawning PTY command"
        );

        // On error `pair` is dropped here, which closes both PTY ends
        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(command = %config.command, error = %e, "failed to spawn command");
            PtyError::SpawnFailed {
                command: config.command.clone(),
                message: format!("{e:#}"),
            }
        })?;
        // The child holds its own copy of the slave; keeping ours open would
        // hide EOF when the child exits.
        drop(pair.slave);
        let master = pair.master;

        let setup = (|| -> Result<_, PtyError> {
            master
                .resize(pty_size(config.size))
                .map_err(|e| PtyError::ResizeFailed(format!("{e:#}")))?;
            let reader = master
                .try_clone_reader()
                .map_err(|e| PtyError::OpenFailed(format!("{e:#}")))?;
            let writer = master
                .take_writer()
                .map_err(|e| PtyError::OpenFailed(format!("{e:#}")))?;
            Ok((reader, writer))
        })();

        let (reader, writer) = match setup {
            Ok(io) => io,
            Err(e) => {
                warn!(error = %e, "PTY setup failed, killing child");
                abandon_child(&mut child);
                return Err(e);
            }
        };

        let pid = child.process_id();
        info!(pid = ?pid, "PTY process started");

        let done = CancellationToken::new();
        let output = Arc::new(OutputLog::new(OUTPUT_CHANNEL_CAPACITY, config.replay_bytes));
        let (size_tx, size_rx) = watch::channel(config.size);
        let (control_tx, control_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let reader_output = output.clone();
        let reader_done = done.clone();
        let read_buffer = config.read_buffer.max(1);
        let threads = std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || read_loop(reader, read_buffer, reader_output, reader_done))
            .and_then(|_| {
                std::thread::Builder::new()
                    .name("pty-writer".into())
                    .spawn(move || write_loop(writer, input_rx))
            });
        if let Err(e) = threads {
            warn!(error = %e, "failed to start PTY I/O threads, killing child");
            abandon_child(&mut child);
            return Err(PtyError::OpenFailed(e.to_string()));
        }

        let actor = Self {
            master,
            child,
            command: config.command,
            size_tx,
            done: done.clone(),
            receiver: control_rx,
        };
        tokio::spawn(actor.run());

        Ok(PtyHandle {
            input: input_tx,
            control: control_tx,
            output,
            size: size_rx,
            done,
            pid,
        })
    }

    async fn run(mut self) {
        info!(
            command = %self.command,
            pid = ?self.child.process_id(),
            "PTY actor started"
        );

        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    // Every handle dropped: nobody can reach this process any more
                    let Some(msg) = msg else { break };
                    match msg {
                        PtyMessage::Resize { size, respond_to } => {
                            let _ = respond_to.send(self.handle_resize(size));
                        }
                        PtyMessage::Close { respond_to } => {
                            let result = self.terminate().await;
                            self.done.cancel();
                            let _ = respond_to.send(result);
                            break;
                        }
                    }
                }
                _ = self.done.cancelled() => break,
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                info!(?status, "PTY process exited");
                break;
            }
        }

        if matches!(self.child.try_wait(), Ok(None)) {
            if let Err(e) = self.terminate().await {
                warn!(error = %e, "failed to terminate PTY process");
            }
        }
        self.done.cancel();
        info!(command = %self.command, "PTY actor shutting down");
    }

    fn handle_resize(&mut self, size: Dimensions) -> Result<(), PtyError> {
        if *self.size_tx.borrow() == size {
            return Ok(());
        }

        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::ResizeFailed(format!("{e:#}")))?;

        self.size_tx.send_replace(size);
        debug!(%size, "PTY resized");
        Ok(())
    }

    /// Hang up on the child, then kill it if it lingers past the grace period
    async fn terminate(&mut self) -> Result<(), PtyError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.process_id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                debug!(pid, error = %e, "SIGHUP failed");
            }

            let deadline = tokio::time::Instant::now() + EXIT_GRACE;
            while tokio::time::Instant::now() < deadline {
                if let Ok(Some(status)) = self.child.try_wait() {
                    debug!(pid, ?status, "PTY process exited after SIGHUP");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            warn!(pid, "PTY process ignored SIGHUP, killing");
        }

        self.child
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;
        let _ = self.child.try_wait();
        Ok(())
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
    output: Arc<OutputLog>,
    done: CancellationToken,
) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                info!("PTY EOF detected - process has exited");
                break;
            }
            Ok(n) => output.publish(buffer[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the last slave fd closes
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
    done.cancel();
    debug!("PTY reader thread exiting");
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut requests: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = requests.blocking_recv() {
        let result = writer
            .write_all(&request.data)
            .and_then(|()| writer.flush())
            .map(|()| request.data.len())
            .map_err(PtyError::write_failed);
        let _ = request.respond_to.send(result);
    }
    debug!("PTY writer thread exiting");
}
