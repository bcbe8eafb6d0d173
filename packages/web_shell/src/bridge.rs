//! Per-connection pump between one WebSocket and one session's process.
//!
//! Each bridge runs three duties as separate tasks:
//!
//! - **inbound**: socket frames → codec → process input / resize
//! - **outbound**: process output → binary frames
//! - **heartbeat**: protocol pings on a fixed period
//!
//! They share a cancellation token; whichever duty ends first cancels the
//! other two. Every await inside a duty, writes and retry sleeps included,
//! also watches that token. Ending a bridge only detaches it. The process is
//! left running for the next connection.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use pty_session::{ProcessHandle, PtyError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::BridgeFileConfig;
use crate::protocol::{self, ControlMessage, Inbound};
use crate::registry::Attachment;

/// Bound on the farewell close frame, independent of `write_wait`
const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Silence from the peer for this long ends the connection
    pub pong_wait: Duration,
    pub ping_period: Duration,
    /// Bound on each socket or process write step
    pub write_wait: Duration,
    pub write_retries: u32,
    /// First retry delay; doubles on each further attempt
    pub retry_backoff: Duration,
}

impl BridgeConfig {
    /// Pings go out at 90% of the read deadline so a healthy peer's pong
    /// always lands in time.
    pub fn new(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            write_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }

    pub fn from_file(fc: &BridgeFileConfig) -> Self {
        Self {
            write_wait: Duration::from_secs(fc.write_wait_secs),
            write_retries: fc.write_retries,
            retry_backoff: Duration::from_millis(fc.retry_backoff_ms.max(1)),
            ..Self::new(Duration::from_secs(fc.pong_wait_secs))
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_file(&BridgeFileConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("timed out writing to websocket")]
    SocketStalled,
    #[error("process did not accept input within {0:?}")]
    ProcessStalled(Duration),
    #[error(transparent)]
    Process(#[from] PtyError),
    /// Another duty ended the bridge while this one was mid-write
    #[error("bridge cancelled")]
    Cancelled,
}

/// Why a bridge ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    PeerClosed,
    PeerTimeout,
    SocketError,
    ProcessEnded,
    ProcessWriteFailed,
    /// The client could not keep up with the session's output
    OutputLagged,
    Shutdown,
}

impl ExitReason {
    fn close_frame(self) -> CloseFrame {
        match self {
            ExitReason::Shutdown => CloseFrame {
                code: close_code::AWAY,
                reason: Utf8Bytes::from_static("server shutting down"),
            },
            ExitReason::ProcessEnded => CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static("session ended"),
            },
            // Reconnecting resumes from the replay tail instead of a torn stream
            ExitReason::OutputLagged => CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static("output fell behind, reconnect"),
            },
            _ => CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(""),
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Retry {
    Again,
    Exhausted,
    Cancelled,
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Exponential backoff over a bounded number of retries
struct Backoff {
    remaining: u32,
    delay: Duration,
}

impl Backoff {
    fn new(config: &BridgeConfig) -> Self {
        Self {
            remaining: config.write_retries,
            delay: config.retry_backoff,
        }
    }

    /// Sleep before the next attempt, cut short if `done` fires
    async fn wait(&mut self, done: &CancellationToken) -> Retry {
        if self.remaining == 0 {
            return Retry::Exhausted;
        }
        self.remaining -= 1;
        tokio::select! {
            biased;
            _ = done.cancelled() => return Retry::Cancelled,
            _ = tokio::time::sleep(self.delay) => {}
        }
        self.delay = self.delay.saturating_mul(2);
        Retry::Again
    }
}

/// Pump bytes between `socket` and the attached session until either side
/// ends or `shutdown` fires. Returns once all three duties have stopped.
pub async fn serve(
    socket: WebSocket,
    attachment: Attachment,
    config: BridgeConfig,
    shutdown: CancellationToken,
) -> ExitReason {
    let conn_id = uuid::Uuid::new_v4();
    let session = Arc::clone(attachment.session());
    let span = info_span!("bridge", %conn_id, session = %session.name());

    async move {
        info!(attached = session.attached(), "client attached");

        // Subscribe before any duty runs so replayed output is first on the wire
        let output = session.handle().subscribe();
        let (sink, stream) = socket.split();
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let done = shutdown.child_token();
        let current = tracing::Span::current();

        let inbound = tokio::spawn(
            run_duty(
                done.clone(),
                inbound_pump(
                    stream,
                    Arc::clone(session.handle()),
                    config.clone(),
                    done.clone(),
                ),
            )
            .instrument(current.clone()),
        );
        let outbound = tokio::spawn(
            run_duty(
                done.clone(),
                outbound_pump(output, Arc::clone(&sink), config.clone(), done.clone()),
            )
            .instrument(current.clone()),
        );
        let heartbeat = tokio::spawn(
            run_duty(
                done.clone(),
                heartbeat_pump(Arc::clone(&sink), config.clone(), done.clone()),
            )
            .instrument(current),
        );

        let (inbound, outbound, heartbeat) = tokio::join!(inbound, outbound, heartbeat);
        let reason = first_exit_reason([
            ("inbound", inbound),
            ("outbound", outbound),
            ("heartbeat", heartbeat),
        ])
        .unwrap_or(ExitReason::Shutdown);
        let reason = if shutdown.is_cancelled() {
            ExitReason::Shutdown
        } else {
            reason
        };

        say_goodbye(&sink, reason).await;
        drop(attachment);
        info!(?reason, attached = session.attached(), "client detached");
        reason
    }
    .instrument(span)
    .await
}

/// The reason reported by the earliest duty in `results` that gave one.
/// Every result is inspected so no panicked duty goes unlogged.
fn first_exit_reason(
    results: impl IntoIterator<Item = (&'static str, Result<Option<ExitReason>, JoinError>)>,
) -> Option<ExitReason> {
    let mut first = None;
    for (duty, joined) in results {
        let reason = match joined {
            Ok(reason) => reason,
            Err(e) => {
                error!(duty, error = %e, "bridge duty panicked");
                Some(ExitReason::SocketError)
            }
        };
        first = first.or(reason);
    }
    first
}

/// Runs one duty and cancels its siblings when it ends. `None` means the duty
/// stopped because another one ended first.
async fn run_duty(
    done: CancellationToken,
    duty: impl Future<Output = Option<ExitReason>>,
) -> Option<ExitReason> {
    let reason = duty.await;
    done.cancel();
    reason
}

async fn inbound_pump(
    mut stream: SplitStream<WebSocket>,
    handle: Arc<dyn ProcessHandle>,
    config: BridgeConfig,
    done: CancellationToken,
) -> Option<ExitReason> {
    loop {
        // Any frame, data or pong, refreshes the deadline
        let next = tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            next = timeout(config.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(pong_wait = ?config.pong_wait, "no traffic from client, dropping connection");
                return Some(ExitReason::PeerTimeout);
            }
            Ok(None) => {
                debug!("client went away");
                return Some(ExitReason::PeerClosed);
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "websocket read failed");
                return Some(ExitReason::SocketError);
            }
            Ok(Some(Ok(message))) => message,
        };

        let result = match &message {
            Message::Binary(data) => handle_payload(handle.as_ref(), data, &config, &done).await,
            Message::Text(text) => {
                handle_payload(handle.as_ref(), text.as_str().as_bytes(), &config, &done).await
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!("liveness frame");
                Ok(())
            }
            Message::Close(frame) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "client closed connection");
                return Some(ExitReason::PeerClosed);
            }
        };

        match result {
            Ok(()) => {}
            Err(BridgeError::Cancelled) => return None,
            Err(e) => {
                warn!(error = %e, "writing to session failed");
                return Some(ExitReason::ProcessWriteFailed);
            }
        }
    }
}

async fn handle_payload(
    handle: &dyn ProcessHandle,
    payload: &[u8],
    config: &BridgeConfig,
    done: &CancellationToken,
) -> Result<(), BridgeError> {
    match protocol::classify(payload) {
        Inbound::Control(ControlMessage::Resize { dimensions }) => {
            match dimensions.to_dimensions() {
                Some(size) => {
                    debug!(%size, "resize");
                    // A failed resize leaves the old size in place
                    let resized = tokio::select! {
                        biased;
                        _ = done.cancelled() => return Err(BridgeError::Cancelled),
                        resized = handle.resize(size) => resized,
                    };
                    if let Err(e) = resized {
                        warn!(%size, error = %e, "resize failed");
                    }
                }
                None => debug!(?dimensions, "ignoring resize to illegal size"),
            }
            Ok(())
        }
        Inbound::Control(ControlMessage::Keepalive) => {
            trace!("keepalive");
            Ok(())
        }
        Inbound::Raw(data) => write_to_process(handle, data, config, done).await,
    }
}

/// Write all of `data`, retrying transient failures with backoff.
///
/// A write that does not finish within `write_wait` is not retried: the
/// bytes may already be queued and a retry would duplicate them.
async fn write_to_process(
    handle: &dyn ProcessHandle,
    data: &[u8],
    config: &BridgeConfig,
    done: &CancellationToken,
) -> Result<(), BridgeError> {
    let mut backoff = Backoff::new(config);
    let mut offset = 0;

    while offset < data.len() {
        let attempt = tokio::select! {
            biased;
            _ = done.cancelled() => return Err(BridgeError::Cancelled),
            attempt = timeout(config.write_wait, handle.write(&data[offset..])) => attempt,
        };
        let result = attempt.map_err(|_| BridgeError::ProcessStalled(config.write_wait))?;

        match result {
            Ok(0) => return Err(PtyError::Closed.into()),
            Ok(n) => offset += n,
            Err(e) if e.is_transient() => {
                debug!(error = %e, "transient process write failure");
                match backoff.wait(done).await {
                    Retry::Again => {}
                    Retry::Cancelled => return Err(BridgeError::Cancelled),
                    Retry::Exhausted => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn outbound_pump(
    mut output: pty_session::OutputReader,
    sink: SharedSink,
    config: BridgeConfig,
    done: CancellationToken,
) -> Option<ExitReason> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            chunk = output.read() => chunk,
        };

        let data = match chunk {
            Ok(Some(data)) => data,
            Ok(None) => {
                info!("session output ended");
                return Some(ExitReason::ProcessEnded);
            }
            Err(e) => {
                warn!(error = %e, "client fell behind session output, disconnecting");
                return Some(ExitReason::OutputLagged);
            }
        };

        match send_frame(&sink, Message::Binary(data.into()), &config, &done).await {
            Ok(()) => {}
            Err(BridgeError::Cancelled) => return None,
            Err(e) => {
                debug!(error = %e, "sending output failed");
                return Some(ExitReason::SocketError);
            }
        }
    }
}

async fn heartbeat_pump(
    sink: SharedSink,
    config: BridgeConfig,
    done: CancellationToken,
) -> Option<ExitReason> {
    // interval_at panics on a zero period
    let period = config.ping_period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        trace!("ping");
        match send_frame(&sink, Message::Ping(Default::default()), &config, &done).await {
            Ok(()) => {}
            Err(BridgeError::Cancelled) => return None,
            Err(e) => {
                debug!(error = %e, "ping failed");
                return Some(ExitReason::SocketError);
            }
        }
    }
}

/// Stage then flush one frame, each step bounded by `write_wait` and retried
/// with backoff when it times out. Gives up with [`BridgeError::Cancelled`]
/// as soon as `done` fires, even while waiting for the sink.
async fn send_frame<S>(
    sink: &Mutex<S>,
    message: Message,
    config: &BridgeConfig,
    done: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut sink = tokio::select! {
        biased;
        _ = done.cancelled() => return Err(BridgeError::Cancelled),
        sink = sink.lock() => sink,
    };
    let mut backoff = Backoff::new(config);

    loop {
        let staged = tokio::select! {
            biased;
            _ = done.cancelled() => return Err(BridgeError::Cancelled),
            staged = timeout(config.write_wait, sink.feed(message.clone())) => staged,
        };
        match staged {
            Ok(staged) => break staged?,
            Err(_) => {
                stalled(&mut backoff, done).await?;
                debug!("websocket send timed out, retrying");
            }
        }
    }

    loop {
        let flushed = tokio::select! {
            biased;
            _ = done.cancelled() => return Err(BridgeError::Cancelled),
            flushed = timeout(config.write_wait, sink.flush()) => flushed,
        };
        match flushed {
            Ok(flushed) => return flushed.map_err(BridgeError::from),
            Err(_) => {
                stalled(&mut backoff, done).await?;
                debug!("websocket flush timed out, retrying");
            }
        }
    }
}

/// Back off after a timed-out socket step; spent retries mean the peer stalled
async fn stalled(backoff: &mut Backoff, done: &CancellationToken) -> Result<(), BridgeError> {
    match backoff.wait(done).await {
        Retry::Again => Ok(()),
        Retry::Cancelled => Err(BridgeError::Cancelled),
        Retry::Exhausted => Err(BridgeError::SocketStalled),
    }
}

async fn say_goodbye(sink: &SharedSink, reason: ExitReason) {
    if matches!(reason, ExitReason::PeerClosed | ExitReason::SocketError) {
        return;
    }
    let mut sink = sink.lock().await;
    let close = Message::Close(Some(reason.close_frame()));
    match timeout(CLOSE_WAIT, sink.send(close)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "close frame not delivered"),
        Err(_) => debug!("close frame timed out"),
    }
}
