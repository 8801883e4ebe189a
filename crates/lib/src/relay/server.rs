//! Relay HTTP + WebSocket server (single port).

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, Method},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::api;
use super::hub::{Relay, RelaySettings};
use super::protocol::{ClientEvent, ServerEvent};
use crate::config::{self, Config};
use crate::dispatch::ResponseDispatcher;
use crate::session::SessionStore;
use crate::transcription;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct RelayState {
    pub relay: Arc<Relay>,
    /// Port actually bound (reported by the health endpoint).
    pub port: u16,
}

/// Build a relay from config: open the session store, register provider families that
/// have credentials, and pick the transcription backend.
pub async fn build_relay(config: &Config) -> Result<Arc<Relay>> {
    let store_path = config::resolve_store_path(config);
    let store = SessionStore::open(&store_path)
        .await
        .with_context(|| format!("opening session store {}", store_path.display()))?;
    let dispatcher = ResponseDispatcher::from_config(config);
    if dispatcher.families().is_empty() {
        log::warn!("no provider credentials configured; messages will get an error reply");
    }
    let transcriber = transcription::from_config(&config.transcription);
    Ok(Arc::new(Relay::new(
        Arc::new(store),
        Arc::new(dispatcher),
        transcriber,
        RelaySettings::from(&config.relay),
    )))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                log::warn!("cors: ignoring invalid origin {:?}", origin);
                None
            })
        })
        .collect();
    log::info!("cors: allowing {} origin(s)", origins.len());
    layer.allow_origin(AllowOrigin::list(origins))
}

/// All relay routes with CORS applied.
pub fn router(state: RelayState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(api::health))
        .route("/health", get(api::health))
        .route("/ws", get(ws_handler))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/all", delete(api::delete_all_sessions))
        .route("/api/sessions/:id", delete(api::delete_session))
        .route(
            "/api/sessions/:id/messages",
            get(api::get_messages)
                .post(api::post_message)
                .delete(api::clear_messages),
        )
        .route("/api/sessions/:id/help", post(api::request_help))
        .route("/api/keys/status", get(api::key_status))
        .route("/api/keys/unblock", post(api::unblock_keys))
        .route("/api/models", get(api::models))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

/// Serve `relay` on an already-bound listener until `shutdown` completes; then every
/// connected socket is sent `shutdown`.
pub async fn serve<F>(
    listener: TcpListener,
    relay: Arc<Relay>,
    allowed_origins: &[String],
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener.local_addr().context("reading bound address")?.port();
    let app = router(
        RelayState {
            relay: relay.clone(),
            port,
        },
        allowed_origins,
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let n = relay.shutdown();
            log::info!("shutdown broadcast to {} connection(s), draining", n);
        })
        .await
        .context("relay server exited")?;
    log::info!("relay stopped");
    Ok(())
}

/// Run the relay from config. Blocks until SIGINT/SIGTERM.
pub async fn run_relay(config: Config) -> Result<()> {
    let relay = build_relay(&config).await?;
    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);
    serve(
        listener,
        relay,
        &config.server.allowed_origins,
        shutdown_signal(),
    )
    .await
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    /// Reconnecting chatbots pass their previous socket id to resume their session. Resume is
    /// unauthenticated: whoever presents a free socket id gets that socket's session.
    pub socket_id: Option<String>,
}

/// GET /ws upgrades to WebSocket.
async fn ws_handler(
    State(state): State<RelayState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, params.socket_id))
}

/// One connection: a writer task drains the relay's queue for this socket while the reader
/// feeds frames to the relay in order and enforces the identify deadline.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, requested_id: Option<String>) {
    let (socket_id, mut events) = relay.connect(requested_id.as_deref());
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let is_shutdown = matches!(event, ServerEvent::Shutdown {});
            if sink.send(Message::Text(event.to_frame())).await.is_err() {
                break;
            }
            if is_shutdown {
                let _ = sink.close().await;
                break;
            }
        }
    });

    let deadline = tokio::time::sleep(relay.settings().identify_timeout);
    tokio::pin!(deadline);
    let mut identified = false;

    loop {
        tokio::select! {
            _ = &mut deadline, if !identified => {
                identified = true;
                relay.auto_identify(&socket_id).await;
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match ClientEvent::parse(&text) {
                    Ok(event) => {
                        if matches!(event, ClientEvent::Identify { .. }) {
                            identified = true;
                        }
                        relay.handle_event(&socket_id, event).await;
                    }
                    Err(e) => log::debug!("relay: dropping frame from {}: {}", socket_id, e),
                }
            }
        }
    }

    relay.disconnect(&socket_id);
    let _ = writer.await;
}
