use std::io;

/// Errors that can occur while launching or driving a PTY session.
///
/// The type is `Clone` so that a single launch outcome can be handed to every
/// caller waiting on the same in-flight launch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PtyError {
    /// Failed to allocate the PTY pair
    #[error("failed to open PTY: {0}")]
    OpenFailed(String),
    /// The child process could not be started inside the PTY
    #[error("failed to spawn `{command}`: {message}")]
    SpawnFailed { command: String, message: String },
    /// Failed to resize PTY
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    /// Failed to write to PTY
    #[error("failed to write to PTY: {message}")]
    WriteFailed { kind: io::ErrorKind, message: String },
    /// Failed to kill PTY process
    #[error("failed to terminate PTY process: {0}")]
    KillFailed(String),
    /// The PTY process has exited or the handle was closed
    #[error("PTY process has exited")]
    Closed,
    /// An operation did not complete within its deadline
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The session manager has no session with this name
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// A subscriber fell behind and this many output chunks were dropped
    /// before it could read them
    #[error("output reader fell behind by {0} chunks")]
    OutputLagged(u64),
    /// The session manager failed or is not installed
    #[error("multiplexer error: {0}")]
    Multiplexer(String),
}

impl PtyError {
    pub(crate) fn write_failed(err: io::Error) -> Self {
        PtyError::WriteFailed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Whether a retry after a short backoff may succeed.
    ///
    /// Broken pipes, EOF and a closed handle are final: the process side of
    /// the pipe is gone.
    pub fn is_transient(&self) -> bool {
        match self {
            PtyError::WriteFailed { kind, .. } => matches!(
                kind,
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            PtyError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PtyError::SessionNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_write_errors() {
        let err = PtyError::write_failed(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_transient());
        let err = PtyError::write_failed(io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_transient());
        assert!(PtyError::Timeout("pty write").is_transient());
    }

    #[test]
    fn test_fatal_write_errors() {
        let err = PtyError::write_failed(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_transient());
        let err = PtyError::write_failed(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(!err.is_transient());
        assert!(!PtyError::Closed.is_transient());
        assert!(!PtyError::OutputLagged(3).is_transient());
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(PtyError::SessionNotFound("main".into()).is_not_found());
        assert!(!PtyError::Multiplexer("boom".into()).is_not_found());
    }

    #[test]
    fn test_display_includes_command() {
        let err = PtyError::SpawnFailed {
            command: "/bin/nope".into(),
            message: "No such file or directory".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn `/bin/nope`: No such file or directory"
        );
    }
}
