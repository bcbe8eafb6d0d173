use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::PtyError;

/// Fan-out point for a process's output.
///
/// Every published chunk goes to all current subscribers and into a bounded
/// replay buffer, so a reader attaching later starts with the recent screen
/// contents instead of a blank terminal.
pub struct OutputLog {
    tx: broadcast::Sender<Vec<u8>>,
    replay: Mutex<ReplayBuffer>,
}

struct ReplayBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    limit: usize,
}

impl ReplayBuffer {
    fn push(&mut self, data: &[u8]) {
        if self.limit == 0 {
            return;
        }
        self.chunks.push_back(data.to_vec());
        self.total += data.len();

        while self.total > self.limit {
            match self.chunks.pop_front() {
                Some(removed) => self.total = self.total.saturating_sub(removed.len()),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl OutputLog {
    pub fn new(capacity: usize, replay_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            replay: Mutex::new(ReplayBuffer {
                chunks: VecDeque::new(),
                total: 0,
                limit: replay_limit,
            }),
        }
    }

    fn replay(&self) -> MutexGuard<'_, ReplayBuffer> {
        self.replay.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, data: Vec<u8>) {
        // Holding the replay lock across the send keeps subscribe() from
        // seeing a chunk both in its snapshot and on its receiver.
        let mut replay = self.replay();
        replay.push(&data);
        let _ = self.tx.send(data);
    }

    pub fn subscribe(&self, done: CancellationToken) -> OutputReader {
        let replay = self.replay();
        let rx = self.tx.subscribe();
        let pending = replay.snapshot();
        OutputReader {
            rx,
            done,
            pending: (!pending.is_empty()).then_some(pending),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Per-subscriber view of a process's output.
///
/// Chunks arrive in the order the process produced them, with no gaps. A
/// reader that falls behind the channel capacity does not stall the PTY read
/// loop: its next read fails with [`PtyError::OutputLagged`] and the stream it
/// was following is over. Subscribing again starts from the replay tail.
pub struct OutputReader {
    rx: broadcast::Receiver<Vec<u8>>,
    done: CancellationToken,
    pending: Option<Vec<u8>>,
}

impl OutputReader {
    /// Next chunk of output, or `Ok(None)` once the process has ended and
    /// every chunk published before that has been read.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, PtyError> {
        if let Some(replay) = self.pending.take() {
            return Ok(Some(replay));
        }
        let skipped = tokio::select! {
            biased;
            res = self.rx.recv() => match res {
                Ok(data) => return Ok(Some(data)),
                Err(RecvError::Closed) => return Ok(None),
                Err(RecvError::Lagged(skipped)) => skipped,
            },
            _ = self.done.cancelled() => match self.rx.try_recv() {
                Ok(data) => return Ok(Some(data)),
                Err(TryRecvError::Lagged(skipped)) => skipped,
                Err(_) => return Ok(None),
            },
        };
        warn!(skipped, "output reader fell behind, stream has a gap");
        Err(PtyError::OutputLagged(skipped))
    }
}
