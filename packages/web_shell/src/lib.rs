//! Browser terminal over WebSocket.
//!
//! Every connection is bridged to one shared, long-lived shell session. The
//! session outlives any single connection and is only torn down by an explicit
//! kill or by server shutdown.

pub mod bridge;
pub mod config;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod ui;

#[cfg(test)]
mod test_helpers;

pub use bridge::{BridgeConfig, BridgeError, ExitReason};
pub use config::{FileConfig, MultiplexerKind, WebShellDirs, load_config};
pub use lifecycle::{Lifecycle, PidFile, ShutdownReport, termination_signal};
pub use protocol::{ControlMessage, Inbound, classify};
pub use registry::{Attachment, RegistryError, Session, SessionInfo, SessionRegistry};
pub use server::{AppState, ServerSettings, router};
