use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::PtyError;
use crate::output::OutputReader;

/// Terminal size in character cells. Both fields are always positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Dimensions {
    pub fn new(rows: u16, cols: u16) -> Option<Self> {
        (rows > 0 && cols > 0).then_some(Self { rows, cols })
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A running, PTY-backed process shared by every connection attached to it.
///
/// `close` tears the process down and must only be called by whoever owns the
/// session; connections detach by dropping their [`OutputReader`].
#[async_trait]
pub trait ProcessHandle: Send + Sync + 'static {
    /// Write raw bytes to the process input
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError>;

    /// Resize the terminal. Resizing to the current size is a no-op.
    async fn resize(&self, size: Dimensions) -> Result<(), PtyError>;

    /// Current terminal size
    fn dimensions(&self) -> Dimensions;

    /// Attach a new reader to the output stream
    fn subscribe(&self) -> OutputReader;

    /// Terminate the process. Calling this twice is a no-op.
    async fn close(&self) -> Result<(), PtyError>;

    /// Fires once the process has exited or been closed
    fn done(&self) -> CancellationToken;

    fn pid(&self) -> Option<u32>;
}
