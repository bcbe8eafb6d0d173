//! PTY Session - long-lived shell processes behind a pseudo-terminal
//!
//! This crate starts (or re-attaches to) a named shell session inside a PTY and
//! hands back a shared [`ProcessHandle`]. It has no HTTP or WebSocket knowledge.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pty_session::{Direct, LaunchOptions, PtyLauncher, SessionLauncher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let launcher = PtyLauncher::new(Arc::new(Direct), LaunchOptions::default());
//!     let handle = launcher.launch("main").await.unwrap();
//!
//!     let mut output = handle.subscribe();
//!     handle.write(b"echo hello\n").await.unwrap();
//!
//!     while let Ok(Some(chunk)) = output.read().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//! }
//! ```

mod error;
mod handle;
mod launcher;
mod multiplexer;
mod output;
pub mod pty;

pub use error::PtyError;
pub use handle::{Dimensions, ProcessHandle};
pub use launcher::{LaunchOptions, PtyLauncher, SessionLauncher};
pub use multiplexer::{CommandSpec, Direct, Multiplexer, Tmux};
pub use output::{OutputLog, OutputReader};
pub use pty::{PtyConfig, PtyHandle};
