use anyhow::{Context, Result, ensure};
use pty_session::{Dimensions, Direct, LaunchOptions, Multiplexer, Tmux};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [session]
//                    multiplexer = "none"
//
//   env var:         WEBSHELL_SESSION__MULTIPLEXER=none   (double underscore = nesting)
//
//   (single underscore stays within field names: WEBSHELL_BRIDGE__PONG_WAIT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
    #[serde(default)]
    pub lifecycle: LifecycleFileConfig,
}

impl FileConfig {
    /// Reject values that would break the server at runtime instead of at
    /// startup. Run after every layer, CLI flags included, is applied.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.server.ws_path.starts_with('/'),
            "server.ws_path must start with '/', got {:?}",
            self.server.ws_path
        );
        ensure!(self.server.max_message_kb > 0, "server.max_message_kb must be at least 1");
        ensure!(!self.session.name.is_empty(), "session.name must not be empty");
        ensure!(!self.session.shell.is_empty(), "session.shell must not be empty");
        ensure!(
            self.bridge.pong_wait_secs > 0,
            "bridge.pong_wait_secs must be at least 1"
        );
        ensure!(
            self.bridge.write_wait_secs > 0,
            "bridge.write_wait_secs must be at least 1"
        );
        ensure!(
            self.client.keepalive_secs > 0,
            "client.keepalive_secs must be at least 1"
        );
        ensure!(
            self.lifecycle.shutdown_timeout_secs > 0,
            "lifecycle.shutdown_timeout_secs must be at least 1"
        );
        Ok(())
    }
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Largest client frame accepted, in KiB
    #[serde(default = "default_max_message_kb")]
    pub max_message_kb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_message_kb: default_max_message_kb(),
        }
    }
}

impl ServerFileConfig {
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_kb * 1024
    }
}

/// Which session manager backs the shell.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerKind {
    /// Shell runs inside a tmux session that outlives the server
    Tmux,
    /// Shell runs directly in the PTY
    None,
}

/// The shared shell session (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_session_name")]
    pub name: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_multiplexer")]
    pub multiplexer: MultiplexerKind,
    #[serde(default = "default_tmux_binary")]
    pub tmux_binary: String,
    /// Dedicated tmux server (`tmux -L`); empty uses the default server
    #[serde(default = "default_tmux_socket")]
    pub tmux_socket: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Upper bound for each session-manager command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
    /// Output tail replayed to a newly attached client, in KiB
    #[serde(default = "default_replay_kb")]
    pub replay_kb: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            name: default_session_name(),
            shell: default_shell(),
            multiplexer: default_multiplexer(),
            tmux_binary: default_tmux_binary(),
            tmux_socket: default_tmux_socket(),
            working_dir: None,
            rows: default_rows(),
            cols: default_cols(),
            command_timeout_secs: default_command_timeout_secs(),
            read_buffer_bytes: default_read_buffer_bytes(),
            replay_kb: default_replay_kb(),
        }
    }
}

impl SessionFileConfig {
    /// Zero in either field falls back to the 80x24 default.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.rows, self.cols).unwrap_or_default()
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            shell: self.shell.clone(),
            working_dir: self.working_dir.clone(),
            env: Vec::new(),
            size: self.dimensions(),
            read_buffer: self.read_buffer_bytes.max(1),
            replay_bytes: self.replay_kb * 1024,
        }
    }

    pub fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        match self.multiplexer {
            MultiplexerKind::Tmux => Arc::new(
                Tmux::new(
                    self.tmux_binary.clone(),
                    Duration::from_secs(self.command_timeout_secs.max(1)),
                )
                .with_socket(self.tmux_socket.clone()),
            ),
            MultiplexerKind::None => Arc::new(Direct),
        }
    }
}

/// Connection liveness and write bounds (lives under `[bridge]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: default_pong_wait_secs(),
            write_wait_secs: default_write_wait_secs(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Browser-side behaviour, rendered into the page (lives under `[client]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleFileConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for LifecycleFileConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl LifecycleFileConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_max_message_kb() -> usize {
    32
}
fn default_session_name() -> String {
    "main".to_string()
}
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}
fn default_multiplexer() -> MultiplexerKind {
    MultiplexerKind::Tmux
}
fn default_tmux_binary() -> String {
    "tmux".to_string()
}
fn default_tmux_socket() -> String {
    "webshell".to_string()
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_command_timeout_secs() -> u64 {
    5
}
fn default_read_buffer_bytes() -> usize {
    8192
}
fn default_replay_kb() -> usize {
    64
}
fn default_pong_wait_secs() -> u64 {
    60
}
fn default_write_wait_secs() -> u64 {
    10
}
fn default_write_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    10
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → WEBSHELL_* env vars.
///
/// `config_file` replaces `<data_dir>/config.toml` when given. A missing file
/// is skipped. Env vars use double-underscore for nesting into sections:
///   `WEBSHELL_SERVER__PORT=9000`  →  `server.port = 9000`
///   `WEBSHELL_SESSION__NAME=dev`  →  `session.name = "dev"`
pub fn load_config(data_dir: &Path, config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join("config.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("WEBSHELL_").split("__"))
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct WebShellDirs {
    pub data_dir: PathBuf,
}

impl WebShellDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".webshell"),
        };

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir().join("webshell.pid")
    }

}
