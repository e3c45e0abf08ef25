//! ==============================================================================
//! server.rs - viewer web server
//! ==============================================================================
//!
//! routes:
//!     GET /                          viewer page (file on disk, else embedded)
//!     GET /ws                        live channel (websocket, json text frames)
//!     GET /api/state                 current state as a moisture_update
//!     GET /web_assets/{file}         exported 3d models
//!     GET /static/web_assets/{file}  same directory, legacy path
//!
//! every websocket session registers with the bridge on connect, receives the
//! current state first, then every live broadcast until either side closes.
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::ServerConfig;
use crate::domain::ClientMessage;

/// Page served when no viewer file exists on disk.
const DEFAULT_VIEWER_HTML: &str = include_str!("viewer.html");

#[derive(Clone)]
struct AppState {
    bridge: Arc<Bridge>,
    index_page: PathBuf,
}

pub fn router(bridge: Arc<Bridge>, config: &ServerConfig) -> Router {
    let state = AppState {
        bridge,
        index_page: config.index_page.clone(),
    };

    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .nest_service("/web_assets", ServeDir::new(&config.assets_dir))
        .nest_service("/static/web_assets", ServeDir::new(&config.assets_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(bridge: Arc<Bridge>, config: &ServerConfig) -> Result<()> {
    let app = router(bridge, config);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("viewer live at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    match tokio::fs::read_to_string(&state.index_page).await {
        Ok(page) => Html(page),
        Err(e) => {
            debug!(path = %state.index_page.display(), "using embedded viewer: {}", e);
            Html(DEFAULT_VIEWER_HTML.to_string())
        }
    }
}

/// json api endpoint for programmatic access
async fn state_handler(State(state): State<AppState>) -> Json<ClientMessage> {
    Json(state.bridge.snapshot_message().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state.bridge))
}

async fn client_session(socket: WebSocket, bridge: Arc<Bridge>) {
    let mut client = bridge.join().await;
    let id = client.id();
    info!(client = id, connected = bridge.connected_clients(), "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = client.recv() => {
                let Some(message) = outbound else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(client = id, "serialization error: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json)).await {
                    debug!(client = id, "send failed: {}", e);
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client = id, "receive failed: {}", e);
                        break;
                    }
                    // the viewer never sends anything meaningful upstream
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(client = id, "client disconnected");
}
