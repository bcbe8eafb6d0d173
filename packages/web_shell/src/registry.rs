use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use pty_session::{ProcessHandle, PtyError, SessionLauncher};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to launch session `{name}`: {source}")]
    Launch {
        name: String,
        #[source]
        source: PtyError,
    },
    #[error("launch of session `{0}` was aborted")]
    Aborted(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("failed to tear down session `{name}`: {source}")]
    Teardown {
        name: String,
        #[source]
        source: PtyError,
    },
    #[error("session registry is shutting down")]
    ShuttingDown,
}

/// A live, named shell session and the process behind it.
///
/// The handle never changes after launch. Connections hold an [`Attachment`]
/// while bridged; dropping it detaches without touching the process.
pub struct Session {
    name: String,
    handle: Arc<dyn ProcessHandle>,
    created_at: DateTime<Utc>,
    attached: AtomicUsize,
}

impl Session {
    fn new(name: String, handle: Arc<dyn ProcessHandle>) -> Self {
        Self {
            name,
            handle,
            created_at: Utc::now(),
            attached: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Arc<dyn ProcessHandle> {
        &self.handle
    }

    /// Number of connections currently bridged to this session
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.done().is_cancelled()
    }

    pub fn attach(self: &Arc<Self>) -> Attachment {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Attachment {
            session: Arc::clone(self),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.handle.dimensions();
        SessionInfo {
            name: self.name.clone(),
            rows: size.rows,
            cols: size.cols,
            pid: self.handle.pid(),
            attached: self.attached(),
            alive: self.is_alive(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("pid", &self.handle.pid())
            .field("attached", &self.attached())
            .finish()
    }
}

/// One connection's claim on a session. Detaches on drop.
pub struct Attachment {
    session: Arc<Session>,
}

impl Attachment {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.attached.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot served by the sessions API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub rows: u16,
    pub cols: u16,
    pub pid: Option<u32>,
    pub attached: usize,
    pub alive: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownSummary {
    pub closed: usize,
    pub failed: usize,
}

type LaunchResult = Result<Arc<Session>, RegistryError>;
type SharedLaunch = Shared<BoxFuture<'static, LaunchResult>>;

enum Slot {
    Launching { id: u64, launch: SharedLaunch },
    Ready(Arc<Session>),
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Sessions by name, with single-flight creation.
///
/// The map lock only covers deciding what to do. The launch itself runs in
/// its own task and every caller that asked for the same name while it was
/// in flight awaits the same shared result.
pub struct SessionRegistry {
    launcher: Arc<dyn SessionLauncher>,
    slots: Slots,
    next_launch: AtomicU64,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_launch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get_or_create(&self, name: &str) -> LaunchResult {
        let launch = {
            let mut slots = self.slots.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(RegistryError::ShuttingDown);
            }

            let in_flight = match slots.get(name) {
                Some(Slot::Ready(session)) if session.is_alive() => {
                    return Ok(Arc::clone(session));
                }
                Some(Slot::Ready(_)) => {
                    info!(session = name, "session process has exited, relaunching");
                    None
                }
                Some(Slot::Launching { launch, .. }) => Some(launch.clone()),
                None => None,
            };

            match in_flight {
                Some(launch) => {
                    debug!(session = name, "joining in-flight launch");
                    launch
                }
                None => self.start_launch(&mut slots, name),
            }
        };

        launch.await
    }

    fn start_launch(&self, slots: &mut HashMap<String, Slot>, name: &str) -> SharedLaunch {
        let id = self.next_launch.fetch_add(1, Ordering::SeqCst);
        let launcher = Arc::clone(&self.launcher);
        let registry_slots = Arc::clone(&self.slots);
        let session_name = name.to_string();

        // Runs to completion even if every waiter goes away, so the slot is
        // always resolved.
        let task = tokio::spawn(async move {
            info!(session = %session_name, "launching session");
            let result = match launcher.launch(&session_name).await {
                Ok(handle) => Ok(Arc::new(Session::new(session_name.clone(), handle))),
                Err(source) => Err(RegistryError::Launch {
                    name: session_name.clone(),
                    source,
                }),
            };

            let mut slots = registry_slots.lock().await;
            let current = matches!(
                slots.get(&session_name),
                Some(Slot::Launching { id: slot_id, .. }) if *slot_id == id
            );
            if current {
                match &result {
                    Ok(session) => {
                        info!(session = %session_name, pid = ?session.handle.pid(), "session ready");
                        slots.insert(session_name.clone(), Slot::Ready(Arc::clone(session)));
                    }
                    Err(e) => {
                        error!(session = %session_name, error = %e, "session launch failed");
                        slots.remove(&session_name);
                    }
                }
            }
            result
        });

        let abort_name = name.to_string();
        let launch = task
            .map(move |joined| match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(session = %abort_name, error = %e, "launch task failed");
                    Err(RegistryError::Aborted(abort_name))
                }
            })
            .boxed()
            .shared();

        slots.insert(
            name.to_string(),
            Slot::Launching {
                id,
                launch: launch.clone(),
            },
        );
        launch
    }

    /// The session if it is launched and its process is still running
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        match self.slots.lock().await.get(name) {
            Some(Slot::Ready(session)) if session.is_alive() => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let slots = self.slots.lock().await;
        let mut sessions: Vec<_> = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(Arc::clone(session)),
                Slot::Launching { .. } => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Administrative stop of one session: closes its process and removes any
    /// session-manager state. Attached bridges see their output end.
    pub async fn terminate(&self, name: &str) -> Result<(), RegistryError> {
        let slot = self.slots.lock().await.remove(name);
        let session = match slot {
            None => return Err(RegistryError::NotFound(name.to_string())),
            Some(Slot::Ready(session)) => session,
            Some(Slot::Launching { launch, .. }) => launch.await?,
        };
        self.teardown(&session).await
    }

    /// Tear down every session and refuse new ones
    pub async fn shutdown_all(&self) -> TeardownSummary {
        let drained: Vec<(String, Slot)> = {
            let mut slots = self.slots.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            slots.drain().collect()
        };

        let mut summary = TeardownSummary::default();
        for (name, slot) in drained {
            let session = match slot {
                Slot::Ready(session) => session,
                Slot::Launching { launch, .. } => match launch.await {
                    Ok(session) => session,
                    Err(e) => {
                        debug!(session = %name, error = %e, "in-flight launch failed during shutdown");
                        continue;
                    }
                },
            };
            match self.teardown(&session).await {
                Ok(()) => summary.closed += 1,
                Err(e) => {
                    warn!(session = %name, error = %e, "session teardown failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn teardown(&self, session: &Session) -> Result<(), RegistryError> {
        let name = session.name();
        let closed = session.handle.close().await;
        if let Err(e) = &closed {
            warn!(session = name, error = %e, "failed to close session process");
        }
        let destroyed = self.launcher.destroy(name).await;
        if let Err(e) = &destroyed {
            warn!(session = name, error = %e, "failed to destroy session");
        }
        info!(session = name, "session terminated");

        closed
            .and(destroyed)
            .map_err(|source| RegistryError::Teardown {
                name: name.to_string(),
                source,
            })
    }
}
