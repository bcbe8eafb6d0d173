use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Serialize;

use crate::config::ClientFileConfig;

/// Settings the page script reads from `window.WEBSHELL`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConfig<'a> {
    pub session: &'a str,
    pub ws_path: &'a str,
    pub keepalive_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl<'a> PageConfig<'a> {
    pub fn new(session: &'a str, ws_path: &'a str, client: &ClientFileConfig) -> Self {
        Self {
            session,
            ws_path,
            keepalive_ms: client.keepalive_secs * 1000,
            reconnect_base_ms: client.reconnect_base_ms,
            reconnect_max_attempts: client.reconnect_max_attempts,
        }
    }

    /// JSON safe to inline in a `<script>` element
    fn to_script(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("window.WEBSHELL = {};", json.replace("</", "<\\/"))
    }
}

pub fn page(config: &PageConfig<'_>) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "webshell - " (config.session) }
                link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css";
                style { (PreEscaped(CSS)) }
            }
            body {
                header {
                    span class="title" { "webshell" }
                    span class="session" { (config.session) }
                    span id="status" class="status status-connecting" { "connecting" }
                }
                div id="terminal" {}
                div id="banner" class="banner hidden" {}

                script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js" {}
                script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js" {}
                script src="https://cdn.jsdelivr.net/npm/xterm-addon-web-links@0.9.0/lib/xterm-addon-web-links.js" {}
                script { (PreEscaped(config.to_script())) }
                script { (PreEscaped(JAVASCRIPT)) }
            }
        }
    }
}

const CSS: &str = r#"
    * {
        margin: 0;
        padding: 0;
        box-sizing: border-box;
    }

    html, body {
        height: 100%;
        background: #1e1e1e;
        font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Oxygen, Ubuntu, sans-serif;
    }

    body {
        display: flex;
        flex-direction: column;
    }

    header {
        display: flex;
        align-items: center;
        gap: 12px;
        padding: 6px 12px;
        background: #111;
        color: #ddd;
        font-size: 0.85rem;
    }

    .title {
        font-weight: 600;
    }

    .session {
        font-family: 'SF Mono', Monaco, 'Cascadia Code', monospace;
        background: #2a2a2a;
        padding: 2px 8px;
        border-radius: 4px;
    }

    .status {
        margin-left: auto;
        font-weight: 600;
    }

    .status-connected {
        color: #10b981;
    }

    .status-connecting {
        color: #f59e0b;
    }

    .status-failed {
        color: #ef4444;
    }

    #terminal {
        flex: 1;
        padding: 6px;
        min-height: 0;
    }

    .banner {
        padding: 10px 12px;
        background: #7f1d1d;
        color: white;
        text-align: center;
    }

    .banner button {
        margin-left: 12px;
        padding: 4px 12px;
        border: none;
        border-radius: 4px;
        font-weight: 600;
        cursor: pointer;
    }

    .hidden {
        display: none;
    }
"#;

const JAVASCRIPT: &str = r#"
    const cfg = window.WEBSHELL;
    const encoder = new TextEncoder();
    let ws = null;
    let term = null;
    let fitAddon = null;
    let attempts = 0;
    let keepaliveTimer = null;
    let reconnectTimer = null;

    function setStatus(text, cls) {
        const el = document.getElementById('status');
        el.textContent = text;
        el.className = 'status status-' + cls;
    }

    function sendResize() {
        if (ws && ws.readyState === WebSocket.OPEN && term) {
            ws.send(JSON.stringify({
                type: 'resize',
                dimensions: { cols: term.cols, rows: term.rows }
            }));
        }
    }

    function initTerminal() {
        term = new Terminal({
            cursorBlink: true,
            fontSize: 14,
            fontFamily: "'SF Mono', Monaco, 'Cascadia Code', monospace",
            theme: {
                background: '#1e1e1e',
            }
        });

        fitAddon = new FitAddon.FitAddon();
        term.loadAddon(fitAddon);
        term.loadAddon(new WebLinksAddon.WebLinksAddon());

        term.open(document.getElementById('terminal'));
        fitAddon.fit();

        // Keystrokes go out as raw bytes
        term.onData(data => {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(encoder.encode(data));
            }
        });

        term.onResize(() => sendResize());
        window.addEventListener('resize', () => fitAddon && fitAddon.fit());
    }

    function scheduleReconnect() {
        if (attempts >= cfg.reconnectMaxAttempts) {
            setStatus('disconnected', 'failed');
            const banner = document.getElementById('banner');
            banner.textContent = 'Connection lost. Reconnection failed after ' + attempts + ' attempts.';
            const reload = document.createElement('button');
            reload.textContent = 'Reload';
            reload.onclick = () => location.reload();
            banner.appendChild(reload);
            banner.classList.remove('hidden');
            return;
        }
        const delay = Math.min(cfg.reconnectBaseMs * Math.pow(2, attempts), 30000);
        attempts += 1;
        setStatus('reconnecting (' + attempts + '/' + cfg.reconnectMaxAttempts + ')', 'connecting');
        reconnectTimer = setTimeout(connect, delay);
    }

    function connect() {
        reconnectTimer = null;
        const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
        ws = new WebSocket(`${protocol}//${window.location.host}${cfg.wsPath}`);
        ws.binaryType = 'arraybuffer';

        ws.onopen = () => {
            attempts = 0;
            setStatus('connected', 'connected');
            sendResize();
            clearInterval(keepaliveTimer);
            keepaliveTimer = setInterval(() => {
                if (ws.readyState === WebSocket.OPEN) {
                    ws.send(JSON.stringify({ type: 'keepalive' }));
                }
            }, cfg.keepaliveMs);
        };

        ws.onmessage = (event) => {
            if (event.data instanceof ArrayBuffer) {
                term.write(new Uint8Array(event.data));
            } else {
                term.write(event.data);
            }
        };

        ws.onerror = (error) => {
            console.error('WebSocket error:', error);
        };

        ws.onclose = (event) => {
            clearInterval(keepaliveTimer);
            keepaliveTimer = null;
            if (event.code === 1001) {
                term.write('\r\n\x1b[33m[server restarting]\x1b[0m\r\n');
            }
            if (!reconnectTimer) {
                scheduleReconnect();
            }
        };
    }

    document.addEventListener('DOMContentLoaded', () => {
        initTerminal();
        connect();
    });
"#;
