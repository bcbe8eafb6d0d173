use anyhow::{Context, Result, bail};
use clap::Parser;
use pty_session::PtyLauncher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use web_shell::{
    AppState, FileConfig, Lifecycle, MultiplexerKind, PidFile, ServerSettings, SessionRegistry,
    WebShellDirs, load_config, router, termination_signal,
};

/// How long the HTTP server gets to finish in-flight requests after shutdown
const SERVER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "webshell")]
#[command(about = "Shared shell session in the browser over WebSocket")]
struct Args {
    /// Config file (default: <data-dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (default: ~/.webshell)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the HTTP server (0 for automatic)
    #[arg(short, long)]
    port: Option<u16>,

    /// Name of the shared session
    #[arg(short, long)]
    session: Option<String>,

    /// Shell started in new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Session manager backing the shell
    #[arg(short, long, value_enum)]
    multiplexer: Option<MultiplexerKind>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    /// CLI flags sit above config.toml and env vars
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(host) = &self.host {
            fc.server.host = host.clone();
        }
        if let Some(port) = self.port {
            fc.server.port = port;
        }
        if let Some(session) = &self.session {
            fc.session.name = session.clone();
        }
        if let Some(shell) = &self.shell {
            fc.session.shell = shell.clone();
        }
        if let Some(multiplexer) = self.multiplexer {
            fc.session.multiplexer = multiplexer;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "webshell=debug,web_shell=debug,pty_session=debug,tower_http=debug,info"
    } else {
        "webshell=info,web_shell=info,pty_session=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let dirs = WebShellDirs::new(args.data_dir.clone())?;
    let mut fc: FileConfig = load_config(&dirs.data_dir, args.config.as_deref())
        .extract()
        .context("Invalid configuration")?;
    args.apply(&mut fc);
    fc.validate().context("Invalid configuration")?;

    if let Some(pid) = PidFile::running_pid(&dirs.pid_path()) {
        bail!(
            "webshell is already running (pid {pid}, marker {})",
            dirs.pid_path().display()
        );
    }

    info!(
        session = %fc.session.name,
        shell = %fc.session.shell,
        multiplexer = ?fc.session.multiplexer,
        "Starting webshell"
    );

    let launcher = Arc::new(PtyLauncher::new(
        fc.session.multiplexer(),
        fc.session.launch_options(),
    ));
    let registry = Arc::new(SessionRegistry::new(launcher));
    let lifecycle = Arc::new(Lifecycle::new(registry.clone()));
    let settings = Arc::new(ServerSettings::from_file(&fc));

    let addr = format!("{}:{}", fc.server.host, fc.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    let pid_file = PidFile::create(dirs.pid_path()).context("Failed to write PID file")?;
    lifecycle.set_pid_file(pid_file);

    let app = router(AppState {
        registry,
        lifecycle: lifecycle.clone(),
        settings: settings.clone(),
    });

    info!("webshell listening on http://{}", actual_addr);
    info!("");
    info!("Endpoints:");
    info!("  GET  /                          - Terminal page");
    info!("  GET  {:<27} - WebSocket terminal stream", settings.ws_path);
    info!("  GET  /health                    - Liveness and counts");
    info!("  GET  /api/sessions              - List sessions");
    info!("  POST /api/sessions/{{name}}/kill  - Stop a session");

    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(lifecycle.accept_stopped())
            .into_future(),
    );

    let server_exited = tokio::select! {
        signal = termination_signal() => {
            match signal {
                Ok(name) => {
                    info!(signal = name, "Received shutdown signal, cleaning up...");
                    None
                }
                Err(e) => {
                    error!(error = %e, "Failed to install signal handlers, running until the server exits");
                    Some((&mut server).await)
                }
            }
        }
        result = &mut server => Some(result),
    };

    let report = lifecycle
        .shutdown(fc.lifecycle.shutdown_timeout())
        .await;
    if report.abandoned_bridges > 0 || report.sessions_timed_out {
        warn!(?report, "Shutdown was not clean");
    }

    let server_result = match server_exited {
        Some(result) => result,
        None => match tokio::time::timeout(SERVER_DRAIN, &mut server).await {
            Ok(result) => result,
            Err(_) => {
                warn!("HTTP server did not drain in time, aborting");
                server.abort();
                Ok(Ok(()))
            }
        },
    };
    server_result
        .context("Server task failed")?
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
