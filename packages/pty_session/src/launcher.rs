use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PtyError;
use crate::handle::{Dimensions, ProcessHandle};
use crate::multiplexer::Multiplexer;
use crate::pty::{PtyConfig, PtyHandle};

/// Starts or attaches to the process behind a named session
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, session: &str) -> Result<Arc<dyn ProcessHandle>, PtyError>;

    /// Remove any state the session manager keeps for `session`.
    /// A session that is already gone is not an error.
    async fn destroy(&self, session: &str) -> Result<(), PtyError>;
}

/// Settings for the shell started in new sessions
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub shell: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub size: Dimensions,
    pub read_buffer: usize,
    pub replay_bytes: usize,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        let defaults = PtyConfig::default();
        Self {
            shell: defaults.command,
            working_dir: None,
            env: Vec::new(),
            size: defaults.size,
            read_buffer: defaults.read_buffer,
            replay_bytes: defaults.replay_bytes,
        }
    }
}

/// Launches sessions as PTY clients of a [`Multiplexer`]
pub struct PtyLauncher {
    multiplexer: Arc<dyn Multiplexer>,
    options: LaunchOptions,
}

impl PtyLauncher {
    pub fn new(multiplexer: Arc<dyn Multiplexer>, options: LaunchOptions) -> Self {
        Self {
            multiplexer,
            options,
        }
    }
}

#[async_trait]
impl SessionLauncher for PtyLauncher {
    async fn launch(&self, session: &str) -> Result<Arc<dyn ProcessHandle>, PtyError> {
        let multiplexer = self.multiplexer.name();
        let exists = self.multiplexer.has_session(session).await?;

        let attach = if exists {
            self.multiplexer.attach_command(session)
        } else {
            None
        };

        let command = match attach {
            Some(command) => {
                info!(session, multiplexer, "attaching to existing session");
                command
            }
            None => {
                // An orphaned session under this name would make creation fail
                match self.multiplexer.kill_session(session).await {
                    Ok(()) => debug!(session, "cleared stale session"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(session, error = %e, "stale session cleanup failed"),
                }
                info!(session, multiplexer, "creating session");
                self.multiplexer
                    .create_command(session, &self.options.shell)
            }
        };

        let handle = PtyHandle::spawn(PtyConfig {
            command: command.program,
            args: command.args,
            working_dir: self.options.working_dir.clone(),
            env: self.options.env.clone(),
            size: self.options.size,
            read_buffer: self.options.read_buffer,
            replay_bytes: self.options.replay_bytes,
        })?;

        Ok(Arc::new(handle))
    }

    async fn destroy(&self, session: &str) -> Result<(), PtyError> {
        match self.multiplexer.kill_session(session).await {
            Ok(()) => {
                info!(session, "session destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
