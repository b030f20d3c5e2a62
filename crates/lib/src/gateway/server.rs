//! Gateway HTTP + WebSocket server (single port).
//!
//! Each WebSocket connection runs three pieces: the reader (this handler), a writer
//! task draining the client's outbound queue onto the socket, and a processor task
//! that normalizes, routes and relays the client's frames one at a time.

use crate::agent::{AgentRuntime, ChatAgent};
use crate::audio::{AudioPipeline, AudioProcessor, DiarizationClient, VoiceprintClient, VoiceprintStore};
use crate::config::{self, Config};
use crate::envelope::Normalizer;
use crate::gateway::protocol::{
    error_frame, DirectSendRequest, DirectSendResponse, Health, CLOSE_DUPLICATE_CLIENT, CLOSE_DUPLICATE_REASON,
    CLOSE_GOING_AWAY, CLOSE_SHUTDOWN_REASON,
};
use crate::registry::{ClientHandle, ClientId, ConnectionRegistry, RegistryError};
use crate::relay::{relay, RelayEnd};
use crate::router::SessionRouter;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared gateway state (passed to every handler).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub normalizer: Normalizer,
    pub router: SessionRouter,
    /// Root token; cancelling it closes every connection and stops the server.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: Config, runtime: Arc<dyn AgentRuntime>, audio: Option<Arc<dyn AudioProcessor>>) -> Self {
        let router = SessionRouter::from_config(runtime, &config.agents);
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            normalizer: Normalizer::new(audio),
            router,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Audio pipeline from `audio.*` config; None when no transcription endpoint is set.
/// With `audio.voiceprintUrl`, unknown speakers are enrolled and their ids sent back to the transcriber.
pub async fn build_audio_processor(config: &Config) -> Option<Arc<dyn AudioProcessor>> {
    let url = non_empty_url(config.audio.transcribe_url.as_deref())?;
    let mut transcriber = DiarizationClient::new(url, config.audio.api_key.clone());
    let mut identifier = None;
    if let Some(vp_url) = non_empty_url(config.audio.voiceprint_url.as_deref()) {
        let store_path = config::resolve_voiceprint_store(config);
        let store = Arc::new(VoiceprintStore::load(&store_path).await);
        log::info!(
            "audio: voiceprints via {} ({} enrolled, store {})",
            vp_url,
            store.feature_ids().await.len(),
            store_path.display()
        );
        transcriber = transcriber.with_voiceprints(store.clone());
        identifier = Some(VoiceprintClient::new(vp_url, config.audio.api_key.clone(), store));
    }
    let mut pipeline = AudioPipeline::new(Arc::new(transcriber))
        .with_save_dir(config.audio.save_dir.clone())
        .with_min_enroll_ms(config.audio.min_enroll_ms);
    if let Some(identifier) = identifier {
        pipeline = pipeline.with_identifier(Arc::new(identifier));
    }
    log::info!("audio transcription via {}", url);
    Some(Arc::new(pipeline))
}

fn non_empty_url(url: Option<&str>) -> Option<&str> {
    url.map(str::trim).filter(|u| !u.is_empty())
}

/// All gateway routes bound to `state`.
pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws/:client_id", get(ws_handler))
        .route("/get_channel_id", get(list_clients))
        .route("/clients", get(list_clients))
        .route("/send_message", post(send_message))
        .with_state(state)
}

/// Serve on `listener` until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: GatewayState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("gateway server exited")
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && !config.gateway.allow_remote {
        anyhow::bail!(
            "refusing to bind gateway to {} (no auth layer); set gateway.allowRemote to true to allow it",
            bind
        );
    }
    log::info!("using config {}", config_path.display());

    let runtime = Arc::new(ChatAgent::from_config(&config).await);
    log::info!("agent model {} at {}", runtime.model(), config.agents.base_url);
    let audio = build_audio_processor(&config).await;
    let port = config.gateway.port;
    let state = GatewayState::new(config, runtime, audio);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    tokio::spawn(shutdown_signal(state.shutdown.clone()));
    serve(listener, state).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM and cancels the root token.
async fn shutdown_signal(shutdown: CancellationToken) {
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
        _ = shutdown.cancelled() => return,
    }
    log::info!("shutdown signal received, closing connections");
    shutdown.cancel();
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<Health> {
    Json(Health {
        runtime: "running".to_string(),
        clients: state.registry.len().await,
        port: state.config.gateway.port,
    })
}

/// GET /get_channel_id (and /clients): ids of connected clients.
async fn list_clients(State(state): State<GatewayState>) -> Json<Vec<ClientId>> {
    Json(state.registry.list_ids().await)
}

/// POST /send_message: push `content` to one connected client as a raw text frame.
async fn send_message(
    State(state): State<GatewayState>,
    Json(req): Json<DirectSendRequest>,
) -> (StatusCode, Json<DirectSendResponse>) {
    let len = req.content.len();
    match state.registry.send_to(&req.client_id, req.content).await {
        Ok(()) => {
            log::info!("send_message: {} bytes to {}", len, req.client_id);
            (StatusCode::OK, Json(DirectSendResponse::ok()))
        }
        Err(e @ RegistryError::UnknownClient(_)) => {
            log::info!("send_message: {}", e);
            (StatusCode::NOT_FOUND, Json(DirectSendResponse::err(e.to_string())))
        }
        Err(e) => {
            log::warn!("send_message: {}", e);
            (StatusCode::GONE, Json(DirectSendResponse::err(e.to_string())))
        }
    }
}

/// GET /ws/{client_id} upgrades to WebSocket.
async fn ws_handler(
    State(state): State<GatewayState>,
    Path(client_id): Path<ClientId>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(mut socket: WebSocket, client_id: ClientId, state: GatewayState) {
    let (handle, outbound) = ClientHandle::channel();
    if let Err(e) = state.registry.register(&client_id, handle.clone()).await {
        log::warn!("ws: rejecting connection: {}", e);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_DUPLICATE_CLIENT,
                reason: CLOSE_DUPLICATE_REASON.into(),
            })))
            .await;
        return;
    }
    log::info!("ws: {} connected (serial {})", client_id, handle.serial());

    let conn = state.shutdown.child_token();
    let (sink, stream) = socket.split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound, conn.clone(), state.shutdown.clone()));
    let processor = tokio::spawn(process_loop(state.clone(), client_id.clone(), frame_rx, conn.clone()));

    read_loop(stream, frame_tx, &conn, &client_id).await;
    conn.cancel();
    if !state.registry.release(&client_id, &handle).await {
        log::info!("ws: {} already replaced by a newer connection", client_id);
    }
    drop(handle);
    let _ = processor.await;
    let _ = writer.await;
    log::info!("ws: {} disconnected", client_id);
}

/// Forward inbound text frames to the processor until the client closes or `conn` is cancelled.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    frames: mpsc::UnboundedSender<String>,
    conn: &CancellationToken,
    client_id: &str,
) {
    loop {
        let msg = tokio::select! {
            _ = conn.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if frames.send(text).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                log::debug!("ws: ignoring {} byte binary frame from {}", data.len(), client_id);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::debug!("ws: read error from {}: {}", client_id, e);
                break;
            }
        }
    }
}

/// Drain the client's outbound queue onto the socket in FIFO order.
/// Sends a going-away close frame when the gateway is shutting down.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    conn: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = conn.cancelled() => break,
        }
    }
    outbound.close();
    if shutdown.is_cancelled() {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: CLOSE_SHUTDOWN_REASON.into(),
            })))
            .await;
    }
    conn.cancel();
}

/// Handle one client's frames strictly in arrival order.
async fn process_loop(
    state: GatewayState,
    client_id: ClientId,
    mut frames: mpsc::UnboundedReceiver<String>,
    conn: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = conn.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };
        log::debug!("ws: {} sent {} bytes", client_id, frame.len());

        let normalized = tokio::select! {
            _ = conn.cancelled() => break,
            res = state.normalizer.normalize(&client_id, &frame) => res,
        };
        let envelope = match normalized {
            Ok(env) => env,
            Err(e) => {
                log::info!("ws: {} sent a bad frame: {}", client_id, e);
                if let Err(e) = state.registry.send_to(&client_id, error_frame(&e)).await {
                    log::debug!("ws: error frame not delivered: {}", e);
                }
                continue;
            }
        };

        let invocation = conn.child_token();
        let stream = state.router.route(envelope, invocation.clone());
        let outcome = relay(&state.registry, &client_id, stream, &invocation).await;
        log::info!(
            "ws: reply to {} finished ({:?}, {} token(s))",
            client_id,
            outcome.end,
            outcome.delivered
        );
        if outcome.end == RelayEnd::ClientGone {
            break;
        }
    }
}
