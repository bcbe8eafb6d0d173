use axum::{
    Json, Router,
    extract::{Path, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bridge::{self, BridgeConfig};
use crate::config::{ClientFileConfig, FileConfig};
use crate::lifecycle::Lifecycle;
use crate::registry::{RegistryError, SessionInfo, SessionRegistry};
use crate::ui::{self, PageConfig};

/// Request-independent settings the handlers need
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// Session every connection attaches to
    pub session_name: String,
    pub ws_path: String,
    pub max_message_bytes: usize,
    pub bridge: BridgeConfig,
    pub client: ClientFileConfig,
}

impl ServerSettings {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            session_name: fc.session.name.clone(),
            ws_path: fc.server.ws_path.clone(),
            max_message_bytes: fc.server.max_message_bytes(),
            bridge: BridgeConfig::from_file(&fc.bridge),
            client: fc.client.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub lifecycle: Arc<Lifecycle>,
    pub settings: Arc<ServerSettings>,
}

pub fn router(state: AppState) -> Router {
    let ws_path = state.settings.ws_path.clone();
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route(&ws_path, get(websocket_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{name}/kill", post(kill_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let settings = &state.settings;
    let config = PageConfig::new(&settings.session_name, &settings.ws_path, &settings.client);
    Html(ui::page(&config).into_string())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len().await,
        "connections": state.lifecycle.active_connections(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions = state.registry.list().await;
    Json(sessions.iter().map(|s| s.info()).collect())
}

async fn kill_session(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.terminate(&name).await {
        Ok(()) => {
            info!(session = %name, "session killed via API");
            Json(serde_json::json!({ "killed": name })).into_response()
        }
        Err(RegistryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no session named {name}") })),
        )
            .into_response(),
        Err(e) => {
            error!(session = %name, error = %e, "kill failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.lifecycle.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    // Launch before upgrading so a failure is a plain HTTP error
    let session = match state
        .registry
        .get_or_create(&state.settings.session_name)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(session = %state.settings.session_name, error = %e, "cannot attach client");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let attachment = session.attach();
    let shutdown = state.lifecycle.bridge_token();
    let config = state.settings.bridge.clone();
    let lifecycle = Arc::clone(&state.lifecycle);
    let max = state.settings.max_message_bytes;

    ws.max_message_size(max)
        .max_frame_size(max)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            lifecycle
                .track(bridge::serve(socket, attachment, config, shutdown))
                .await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{CountingLauncher, FakeProcess, eventually};
    use futures::{SinkExt, StreamExt};
    use pty_session::{Dimensions, ProcessHandle};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        launcher: Arc<CountingLauncher>,
    }

    impl TestServer {
        async fn start(launcher: CountingLauncher, bridge: BridgeConfig) -> Self {
            let launcher = Arc::new(launcher);
            let registry = Arc::new(SessionRegistry::new(launcher.clone()));
            let lifecycle = Arc::new(Lifecycle::new(registry.clone()));
            let settings = ServerSettings {
                session_name: "main".to_string(),
                bridge,
                ..ServerSettings::from_file(&FileConfig::default())
            };
            let state = AppState {
                registry,
                lifecycle: lifecycle.clone(),
                settings: Arc::new(settings),
            };

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = router(state.clone());
            tokio::spawn(
                axum::serve(listener, app)
                    .with_graceful_shutdown(lifecycle.accept_stopped())
                    .into_future(),
            );

            Self {
                addr,
                state,
                launcher,
            }
        }

        async fn connect(&self) -> Client {
            let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .expect("websocket connect");
            client
        }

        fn process(&self) -> Arc<FakeProcess> {
            self.launcher.last_process().expect("session launched")
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }
    }

    async fn default_server() -> TestServer {
        TestServer::start(CountingLauncher::default(), BridgeConfig::default()).await
    }

    /// Collect binary frames until `expected` bytes have arrived
    async fn read_output(client: &mut Client, expected: usize) -> Vec<u8> {
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.len() < expected {
                match client.next().await {
                    Some(Ok(WsMessage::Binary(data))) => received.extend_from_slice(&data),
                    Some(Ok(_)) => {}
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        })
        .await
        .expect("output in time");
        received
    }

    async fn next_close_code(client: &mut Client) -> Option<u16> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = client.next().await {
                match frame {
                    Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            None
        })
        .await
        .expect("close in time")
    }

    #[tokio::test]
    async fn test_resize_then_input_then_output() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();

        client
            .send(WsMessage::text(
                r#"{"type":"resize","dimensions":{"cols":120,"rows":40}}"#,
            ))
            .await
            .unwrap();
        eventually("resize", || process.dimensions() == Dimensions::new(40, 120).unwrap()).await;

        client.send(WsMessage::text("ls\n")).await.unwrap();
        eventually("input", || process.written() == b"ls\n").await;

        process.emit(b"file1\n");
        process.emit(b"file2\n");
        let output = read_output(&mut client, 12).await;
        assert_eq!(output, b"file1\nfile2\n");

        // The resize never reached the process as input
        assert_eq!(process.written(), b"ls\n");
    }

    #[tokio::test]
    async fn test_keepalive_is_a_noop() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();

        client
            .send(WsMessage::text(r#"{"type":"keepalive"}"#))
            .await
            .unwrap();
        client.send(WsMessage::binary(b"x".to_vec())).await.unwrap();
        eventually("input", || process.written() == b"x").await;

        assert!(process.resizes().is_empty());
        assert_eq!(process.dimensions(), Dimensions::default());
    }

    #[tokio::test]
    async fn test_non_control_payloads_pass_through_verbatim() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();

        let payloads: [&[u8]; 4] = [
            br#"{"type":"bogus"}"#,
            b"{not json",
            b"\x1b[A\x1b[B",
            br#"{"type":"resize"}"#,
        ];
        for payload in payloads {
            client
                .send(WsMessage::binary(payload.to_vec()))
                .await
                .unwrap();
        }

        let expected = payloads.concat();
        eventually("passthrough", || process.written() == expected).await;
    }

    #[tokio::test]
    async fn test_detach_preserves_session() {
        let server = default_server().await;
        let mut first = server.connect().await;
        let second = server.connect().await;
        let session = server.state.registry.get("main").await.unwrap();
        eventually("two attached", || session.attached() == 2).await;

        first.close(None).await.unwrap();
        drop(first);
        eventually("one attached", || session.attached() == 1).await;

        drop(second);
        eventually("none attached", || session.attached() == 0).await;

        let process = server.process();
        assert_eq!(process.close_count(), 0);
        assert!(session.is_alive());

        // Reattaching reuses the running process
        let mut again = server.connect().await;
        eventually("resubscribed", || process.subscribers() == 1).await;
        process.emit(b"still here");
        assert_eq!(read_output(&mut again, 10).await, b"still here");
        assert_eq!(server.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_clients_share_one_launch() {
        let launcher = CountingLauncher::with_delay(Duration::from_millis(100));
        let server = TestServer::start(launcher, BridgeConfig::default()).await;

        let (mut a, mut b) = tokio::join!(server.connect(), server.connect());
        assert_eq!(server.launcher.launches(), 1);

        let process = server.process();
        eventually("both subscribed", || process.subscribers() == 2).await;
        process.emit(b"hello both");
        assert_eq!(read_output(&mut a, 10).await, b"hello both");
        assert_eq!(read_output(&mut b, 10).await, b"hello both");
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped() {
        let bridge = BridgeConfig::new(Duration::from_millis(300));
        let server = TestServer::start(CountingLauncher::default(), bridge).await;

        // Never read, so pings are never answered
        let _client = server.connect().await;
        let session = server.state.registry.get("main").await.unwrap();
        eventually("attached", || session.attached() == 1).await;

        eventually("dropped", || session.attached() == 0).await;
        assert_eq!(server.state.lifecycle.active_connections(), 0);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_pings_keep_responsive_peer_alive() {
        let bridge = BridgeConfig::new(Duration::from_millis(200));
        let server = TestServer::start(CountingLauncher::default(), bridge).await;
        let mut client = server.connect().await;

        // Reading drives automatic pong replies
        let reader = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
            while tokio::time::Instant::now() < deadline {
                if tokio::time::timeout(Duration::from_millis(50), client.next())
                    .await
                    .is_ok_and(|frame| frame.is_none())
                {
                    break;
                }
            }
            client
        });
        let _client = reader.await.unwrap();

        let session = server.state.registry.get("main").await.unwrap();
        assert_eq!(session.attached(), 1);
    }

    #[tokio::test]
    async fn test_process_exit_closes_connection() {
        let server = default_server().await;
        let mut client = server.connect().await;

        server.process().exit();
        assert_eq!(next_close_code(&mut client).await, Some(1000));
    }

    #[tokio::test]
    async fn test_launch_failure_is_503() {
        let launcher = CountingLauncher::default();
        launcher.fail_next(1);
        let server = TestServer::start(launcher, BridgeConfig::default()).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("unexpected error: {other}"),
        }

        // The next attempt launches again
        let _client = server.connect().await;
        assert_eq!(server.launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();

        let big = vec![b'a'; 64 * 1024];
        let _ = client.send(WsMessage::binary(big)).await;
        let session = server.state.registry.get("main").await.unwrap();
        eventually("dropped", || session.attached() == 0).await;
        assert!(process.written().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_shutdown_with_many_clients() {
        let server = default_server().await;
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(server.connect().await);
        }
        let lifecycle = server.state.lifecycle.clone();
        eventually("all bridged", || lifecycle.active_connections() == 5).await;

        let timeout = Duration::from_secs(2);
        let report = lifecycle.shutdown(timeout).await;

        assert!(report.elapsed < timeout);
        assert_eq!(report.abandoned_bridges, 0);
        assert_eq!(report.sessions_closed, 1);
        assert_eq!(server.process().close_count(), 1);
        assert_eq!(server.launcher.destroys(), 1);
        assert_eq!(next_close_code(&mut clients[0]).await, Some(1001));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_process_write() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();
        process.stall_writes();

        client.send(WsMessage::text("ls\n")).await.unwrap();
        eventually("write in flight", || process.stalled_writes() == 1).await;

        let timeout = Duration::from_secs(2);
        let report = server.state.lifecycle.shutdown(timeout).await;

        assert_eq!(report.abandoned_bridges, 0);
        assert!(report.elapsed < timeout / 2);
        assert_eq!(next_close_code(&mut client).await, Some(1001));
    }

    #[tokio::test]
    async fn test_lagging_client_is_told_to_reconnect() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let process = server.process();
        eventually("subscribed", || process.subscribers() == 1).await;

        // No await in between, so the bridge cannot drain any of it
        for i in 0..1000 {
            process.emit(format!("line {i}\r\n").as_bytes());
        }

        assert_eq!(next_close_code(&mut client).await, Some(1013));
        let session = server.state.registry.get("main").await.unwrap();
        eventually("detached", || session.attached() == 0).await;
        assert_eq!(process.close_count(), 0);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_health_and_sessions_api() {
        let server = default_server().await;
        let http = reqwest::Client::new();

        let body = http.get(server.url("/health")).send().await.unwrap().text().await.unwrap();
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 0);

        let _client = server.connect().await;
        let lifecycle = server.state.lifecycle.clone();
        eventually("bridged", || lifecycle.active_connections() == 1).await;

        let body = http.get(server.url("/health")).send().await.unwrap().text().await.unwrap();
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["sessions"], 1);
        assert_eq!(health["connections"], 1);

        let body = http
            .get(server.url("/api/sessions"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let sessions: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(sessions[0]["name"], "main");
        assert_eq!(sessions[0]["cols"], 80);
        assert_eq!(sessions[0]["attached"], 1);
    }

    #[tokio::test]
    async fn test_kill_endpoint() {
        let server = default_server().await;
        let mut client = server.connect().await;
        let http = reqwest::Client::new();

        let response = http
            .post(server.url("/api/sessions/main/kill"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.process().close_count(), 1);
        assert_eq!(next_close_code(&mut client).await, Some(1000));

        let response = http
            .post(server.url("/api/sessions/main/kill"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_index_serves_terminal_page() {
        let server = default_server().await;
        let body = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
        assert!(body.contains("xterm"));
        assert!(body.contains(r#""wsPath":"/ws""#));
    }
}
