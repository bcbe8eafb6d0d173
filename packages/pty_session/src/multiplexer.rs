//! Session managers that keep a shell alive independently of any PTY client.

use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::PtyError;

/// A program plus arguments to run inside a fresh PTY
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// External session manager consulted before a PTY is opened.
///
/// Every query is bounded by the implementation's own timeout.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn has_session(&self, session: &str) -> Result<bool, PtyError>;

    /// Destroy a session. Returns [`PtyError::SessionNotFound`] when absent.
    async fn kill_session(&self, session: &str) -> Result<(), PtyError>;

    /// Command that creates `session` running `shell` and attaches to it
    fn create_command(&self, session: &str, shell: &str) -> CommandSpec;

    /// Command that attaches to an existing `session`, if the manager supports it
    fn attach_command(&self, session: &str) -> Option<CommandSpec>;
}

/// tmux-backed sessions that survive server restarts and can be shared by
/// several terminal clients at once.
///
/// Every command, whether run here or inside the PTY, talks to the same tmux
/// server: the one named by `socket` (`tmux -L`), or the default server when
/// no socket is set. An inherited `TMUX` variable never redirects it.
#[derive(Clone, Debug)]
pub struct Tmux {
    binary: String,
    socket: Option<String>,
    timeout: Duration,
}

impl Tmux {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            socket: None,
            timeout,
        }
    }

    /// Use a dedicated tmux server instead of the user's default one
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    /// `args` prefixed with the server selection
    fn command(&self, args: &[&str]) -> CommandSpec {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket {
            full.extend(["-L", socket.as_str()]);
        }
        full.extend_from_slice(args);
        CommandSpec::new(&self.binary, &full)
    }

    /// `=name` makes tmux match the session name exactly instead of by prefix
    fn target(session: &str) -> String {
        format!("={session}")
    }

    async fn run(&self, args: &[&str]) -> Result<Output, PtyError> {
        let command = self.command(args);
        debug!(binary = %command.program, args = ?command.args, "running tmux");
        let mut cmd = Command::new(&command.program);
        // Same server selection as the PTY child, which never sees TMUX
        cmd.args(&command.args).env_remove("TMUX").kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PtyError::Multiplexer(format!(
                "failed to run {}: {e}",
                self.binary
            ))),
            Err(_) => Err(PtyError::Timeout("tmux command")),
        }
    }
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("session not found")
        || stderr.contains("no server running")
        || stderr.contains("error connecting to")
}

#[async_trait]
impl Multiplexer for Tmux {
    fn name(&self) -> &'static str {
        "tmux"
    }

    async fn has_session(&self, session: &str) -> Result<bool, PtyError> {
        let output = self
            .run(&["has-session", "-t", &Self::target(session)])
            .await?;
        Ok(output.status.success())
    }

    async fn kill_session(&self, session: &str) -> Result<(), PtyError> {
        let output = self
            .run(&["kill-session", "-t", &Self::target(session)])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_session(&stderr) {
            Err(PtyError::SessionNotFound(session.to_string()))
        } else {
            Err(PtyError::Multiplexer(stderr.trim().to_string()))
        }
    }

    fn create_command(&self, session: &str, shell: &str) -> CommandSpec {
        self.command(&["new-session", "-s", session, shell])
    }

    fn attach_command(&self, session: &str) -> Option<CommandSpec> {
        Some(self.command(&["attach-session", "-t", &Self::target(session)]))
    }
}

/// No external manager: the shell runs directly in the PTY and lives exactly
/// as long as the in-process session does.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

#[async_trait]
impl Multiplexer for Direct {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn has_session(&self, _session: &str) -> Result<bool, PtyError> {
        Ok(false)
    }

    async fn kill_session(&self, session: &str) -> Result<(), PtyError> {
        Err(PtyError::SessionNotFound(session.to_string()))
    }

    fn create_command(&self, _session: &str, shell: &str) -> CommandSpec {
        CommandSpec::new(shell, &[])
    }

    fn attach_command(&self, _session: &str) -> Option<CommandSpec> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmux_commands_target_exact_session() {
        let tmux = Tmux::new("tmux", Duration::from_secs(1));
        assert_eq!(
            tmux.create_command("main", "/bin/bash"),
            CommandSpec::new("tmux", &["new-session", "-s", "main", "/bin/bash"])
        );
        assert_eq!(
            tmux.attach_command("main"),
            Some(CommandSpec::new("tmux", &["attach-session", "-t", "=main"]))
        );
    }

    #[test]
    fn test_tmux_socket_prefixes_every_command() {
        let tmux = Tmux::new("tmux", Duration::from_secs(1)).with_socket("webshell");
        assert_eq!(tmux.socket(), Some("webshell"));
        assert_eq!(
            tmux.create_command("main", "/bin/sh"),
            CommandSpec::new(
                "tmux",
                &["-L", "webshell", "new-session", "-s", "main", "/bin/sh"]
            )
        );
        assert_eq!(
            tmux.attach_command("main"),
            Some(CommandSpec::new(
                "tmux",
                &["-L", "webshell", "attach-session", "-t", "=main"]
            ))
        );
        assert_eq!(
            tmux.command(&["has-session", "-t", "=main"]),
            CommandSpec::new("tmux", &["-L", "webshell", "has-session", "-t", "=main"])
        );
    }

    #[test]
    fn test_empty_socket_means_default_server() {
        let tmux = Tmux::new("tmux", Duration::from_secs(1)).with_socket("");
        assert_eq!(tmux.socket(), None);
        assert_eq!(
            tmux.command(&["kill-session"]),
            CommandSpec::new("tmux", &["kill-session"])
        );
    }

    #[test]
    fn test_missing_session_messages() {
        assert!(is_missing_session("can't find session: main"));
        assert!(is_missing_session(
            "no server running on /tmp/tmux-1000/default"
        ));
        assert!(!is_missing_session("unknown option -- z"));
    }

    #[tokio::test]
    async fn test_direct_never_has_sessions() {
        let direct = Direct;
        assert!(!direct.has_session("main").await.unwrap());
        assert!(direct.kill_session("main").await.unwrap_err().is_not_found());
        assert!(direct.attach_command("main").is_none());
        assert_eq!(
            direct.create_command("main", "/bin/zsh"),
            CommandSpec::new("/bin/zsh", &[])
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_multiplexer_error() {
        let tmux = Tmux::new("/nonexistent/tmux-binary", Duration::from_secs(1));
        let err = tmux.has_session("main").await.unwrap_err();
        assert!(matches!(err, PtyError::Multiplexer(_)));
    }
}
