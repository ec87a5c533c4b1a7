//! Demo server managing tenant sessions over a loopback protocol.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then open http://localhost:3000 in your browser.

mod loopback;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tenant_link_core::{Connector, CredentialStore, TenantId};
use tenant_link_session::{ManagerConfig, SessionManager, storage::MemoryCredentialStore};
use tenant_link_transport::websocket::{WsState, create_router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::loopback::LoopbackConnector;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var("TENANT_LINK_CONFIG") {
        Ok(path) => ManagerConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => ManagerConfig::default(),
    };
    let addr: SocketAddr = std::env::var("TENANT_LINK_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".into())
        .parse()
        .context("parsing TENANT_LINK_ADDR")?;

    let store = open_store().await?;
    let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector::new(Duration::from_secs(3)));
    let manager = Arc::new(SessionManager::new(store, connector, &config));
    manager.spawn_recovery();

    let state = AppState {
        manager: Arc::clone(&manager),
    };

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/tenants/{tenant_id}/init", post(init_handler))
        .route("/tenants/{tenant_id}/session", get(session_handler))
        .route("/tenants/{tenant_id}/messages/text", post(send_text_handler))
        .route("/tenants/{tenant_id}/messages/document", post(send_document_handler))
        .route("/tenants/{tenant_id}/logout", post(logout_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(create_router(WsState::from_manager(&manager)));

    // Start server
    tracing::info!("Server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}

async fn open_store() -> anyhow::Result<Arc<dyn CredentialStore>> {
    #[cfg(feature = "sqlite")]
    {
        if let Ok(url) = std::env::var("TENANT_LINK_DATABASE_URL") {
            let store = tenant_link_session::storage::SqliteCredentialStore::connect(&url)
                .await
                .with_context(|| format!("opening {url}"))?;
            tracing::info!(url = %url, "Using SQLite credential store");
            return Ok(Arc::new(store));
        }
    }

    tracing::info!("Using in-memory credential store");
    Ok(Arc::new(MemoryCredentialStore::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
    tracing::info!("Shutting down");
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn init_handler(Path(tenant_id): Path<String>, State(state): State<AppState>) -> Response {
    let tenant = TenantId::new(tenant_id);
    match state.manager.initialize_session(&tenant).await {
        Ok(outcome) => Json(json!({ "outcome": outcome })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

async fn session_handler(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let tenant = TenantId::new(tenant_id);
    Json(json!({
        "has_session": state.manager.has_stored_session(&tenant).await,
        "status": state.manager.status(&tenant),
    }))
}

#[derive(Deserialize)]
struct SendText {
    phone: String,
    text: String,
}

async fn send_text_handler(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<SendText>,
) -> Response {
    let tenant = TenantId::new(tenant_id);
    let dispatcher = state.manager.dispatcher();
    match dispatcher.try_send_text(&tenant, &body.phone, &body.text).await {
        Ok(receipt) => Json(json!({ "sent": true, "id": receipt.id })).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

#[derive(Deserialize)]
struct SendDocument {
    phone: String,
    path: PathBuf,
    file_name: Option<String>,
    caption: Option<String>,
}

async fn send_document_handler(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<SendDocument>,
) -> Response {
    let tenant = TenantId::new(tenant_id);
    let result = state
        .manager
        .dispatcher()
        .try_send_document(
            &tenant,
            &body.phone,
            &body.path,
            body.caption.as_deref(),
            body.file_name.as_deref(),
        )
        .await;
    match result {
        Ok(receipt) => Json(json!({ "sent": true, "id": receipt.id })).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

async fn logout_handler(Path(tenant_id): Path<String>, State(state): State<AppState>) -> Response {
    let tenant = TenantId::new(tenant_id);
    match state.manager.logout(&tenant).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Tenant Link</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin-bottom: 10px; }
        input, button { font-size: 14px; margin-right: 6px; }
        #status { margin: 12px 0; color: #888; }
        #status.ready { color: #4a4; }
        #code { font-family: Menlo, Monaco, monospace; word-break: break-all; color: #fc6; }
        #log { font-family: Menlo, Monaco, monospace; font-size: 13px; white-space: pre-wrap; }
    </style>
</head>
<body>
    <h1>Tenant Link</h1>
    <div>
        <input id="tenant" value="demo" />
        <button id="connect">Watch</button>
        <button id="init">Initialize</button>
        <button id="logout">Logout</button>
    </div>
    <div>
        <input id="phone" placeholder="081234567890" />
        <input id="text" placeholder="message" />
        <button id="send">Send</button>
    </div>
    <div id="status">Not watching</div>
    <div id="code"></div>
    <div id="log"></div>

    <script>
        const $ = (id) => document.getElementById(id);
        let ws;

        function log(line) {
            $('log').textContent = line + '\n' + $('log').textContent;
        }

        function showStatus(status, code) {
            $('status').textContent = status;
            $('status').className = status === 'ready' ? 'ready' : '';
            $('code').textContent = code || '';
        }

        function watch() {
            if (ws) ws.close();
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            const tenant = encodeURIComponent($('tenant').value);
            ws = new WebSocket(`${protocol}//${window.location.host}/ws/${tenant}`);

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.type === 'status') {
                    showStatus(msg.status, msg.pairing_code);
                } else if (msg.type === 'event') {
                    log(JSON.stringify(msg.event));
                    const e = msg.event;
                    if (e.event === 'pairing-code') showStatus('awaiting_pairing', e.code);
                    else if (e.event === 'ready') showStatus('ready');
                    else if (e.event === 'disconnected') showStatus('disconnected');
                } else if (msg.type === 'error') {
                    log('[error] ' + msg.message);
                }
            };
            ws.onclose = () => log('[socket closed]');
        }

        async function call(path, body) {
            const tenant = encodeURIComponent($('tenant').value);
            const res = await fetch(`/tenants/${tenant}/${path}`, {
                method: 'POST',
                headers: { 'content-type': 'application/json' },
                body: body ? JSON.stringify(body) : undefined,
            });
            log(`${path} -> ${res.status} ${await res.text()}`);
        }

        $('connect').onclick = watch;
        $('init').onclick = () => call('init');
        $('logout').onclick = () => call('logout');
        $('send').onclick = () => call('messages/text', { phone: $('phone').value, text: $('text').value });
    </script>
</body>
</html>
"#;
