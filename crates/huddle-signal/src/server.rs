//! HTTP + WebSocket signal server
//!
//! Poll clients use the request/response routes; push clients hold a
//! WebSocket on `/ws`. Both share one registry and one relay, so a polling
//! participant and a push participant in the same room can reach each other.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_core::{Clock, ErrorCode, HuddleError, ParticipantId, RoomName, SignalConfig, SystemClock};

use crate::messages::{
    ClientEvent, ConnectQuery, ErrorDetail, ErrorResponse, HealthResponse, ListQuery,
    ListResponse, PollQuery, PollResponse, PresenceRequest, SendRequest, SendResponse,
    ServerEvent, SuccessResponse,
};
use crate::registry::PresenceRegistry;
use crate::relay::SignalRelay;
use crate::room::PushSender;

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PresenceRegistry>,
    pub relay: Arc<SignalRelay>,
}

/// Signal server
pub struct SignalServer {
    state: AppState,
    config: SignalConfig,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SignalConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(PresenceRegistry::with_clock(config.staleness(), clock));
        let relay = Arc::new(SignalRelay::new(Arc::clone(&registry), config.mailbox_capacity));
        Self {
            state: AppState { registry, relay },
            config,
        }
    }

    /// Routes, without the sweeper
    pub fn router(&self) -> Router {
        Router::new()
            .route("/presence/announce", post(announce))
            .route("/presence/list", get(list))
            .route("/presence/leave", post(leave))
            .route("/identity/claim", post(claim))
            .route("/signal/send", post(send_signal))
            .route("/signal/poll", get(poll_signals))
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener, running the sweeper alongside
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Signal server listening on {}", listener.local_addr()?);

        let sweeper = self.state.registry.spawn_sweeper(self.config.sweep_interval());
        let result = axum::serve(listener, self.router()).await;
        sweeper.abort();
        result
    }

    pub fn registry(&self) -> Arc<PresenceRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.state.registry.room_count()
    }

    /// Get participant count (for monitoring)
    pub fn participant_count(&self) -> usize {
        self.state.registry.participant_count()
    }
}

/// HTTP-facing errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Coordination(#[from] HuddleError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest),
            ApiError::Coordination(e) => {
                let status = match e {
                    HuddleError::IdentityConflict(_) | HuddleError::RoomFull { .. } => {
                        StatusCode::CONFLICT
                    }
                    HuddleError::InvalidRoom(_) | HuddleError::Protocol(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.code())
            }
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

fn parse_room(raw: Option<&str>) -> Result<RoomName, ApiError> {
    RoomName::parse(raw.unwrap_or_default()).map_err(ApiError::from)
}

async fn announce(
    State(state): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let room = parse_room(req.room.as_deref())?;
    state.registry.announce(&req.participant_id, &room);
    Ok(Json(SuccessResponse::ok()))
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let room = parse_room(query.room.as_deref())?;
    Ok(Json(ListResponse {
        participants: state.registry.list(&room),
    }))
}

async fn leave(
    State(state): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let room = parse_room(req.room.as_deref())?;
    state.registry.leave(&req.participant_id, &room);
    Ok(Json(SuccessResponse::ok()))
}

async fn claim(
    State(state): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let room = parse_room(req.room.as_deref())?;
    state.registry.claim(&req.participant_id, &room)?;
    Ok(Json(SuccessResponse::ok()))
}

async fn send_signal(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Json<SendResponse> {
    state.registry.record_liveness(&req.from);
    let delivery = state.relay.relay(&req.from, &req.to, req.signal);
    Json(SendResponse {
        success: true,
        delivered: delivery.delivered(),
    })
}

async fn poll_signals(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Json<PollResponse> {
    Json(PollResponse {
        messages: state.relay.poll(&query.participant_id),
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        rooms: state.registry.room_count(),
        participants: state.registry.participant_count(),
    })
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let room = parse_room(query.room.as_deref())?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, room, query.id)))
}

/// Drive one push connection until it closes
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    room: RoomName,
    requested: Option<ParticipantId>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode server event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let id = match assign_identity(&state, requested) {
        Ok(id) => id,
        Err(e) => {
            debug!("Rejecting push connection: {}", e);
            let _ = tx.send(ServerEvent::error(e.code(), e.to_string()));
            drop(tx);
            let _ = writer.await;
            return;
        }
    };
    let _ = tx.send(ServerEvent::Welcome(id.clone()));
    debug!("Push connection for {} in room {}", id, room);

    let mut joined = false;

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error from {}: {:?}", id, e);
                break;
            }
        };

        let event = match ClientEvent::from_json(&text) {
            Ok(event) => event,
            Err(e) => {
                let _ = tx.send(ServerEvent::error(
                    ErrorCode::InvalidRequest,
                    format!("Invalid frame: {}", e),
                ));
                continue;
            }
        };

        match event {
            ClientEvent::JoinRoom => {
                if joined {
                    debug!("Duplicate join-room from {}", id);
                    continue;
                }
                let others = state.registry.join(&id, &room, tx.clone());
                let _ = tx.send(ServerEvent::AllUsers(others));
                joined = true;
            }
            ClientEvent::Signal { to, signal } => {
                if !joined {
                    let _ = tx.send(ServerEvent::error(ErrorCode::NotJoined, "join-room first"));
                    continue;
                }
                keep_alive(&state, &id, &room, &tx);
                state.relay.relay(&id, &to, signal);
            }
            ClientEvent::Ping => {
                if joined {
                    keep_alive(&state, &id, &room, &tx);
                }
            }
        }
    }

    if joined {
        state.registry.leave(&id, &room);
    }
    writer.abort();
    debug!("Connection closed: {}", id);
}

/// Use the requested identity unless another live connection holds it
fn assign_identity(
    state: &AppState,
    requested: Option<ParticipantId>,
) -> Result<ParticipantId, HuddleError> {
    let Some(id) = requested else {
        return ParticipantId::generate();
    };

    let held_elsewhere = state
        .registry
        .with_participant(&id, |participant| {
            participant.push_sender().is_some_and(|tx| !tx.is_closed())
        })
        .unwrap_or(false);

    if held_elsewhere {
        return Err(HuddleError::IdentityConflict(id));
    }
    Ok(id)
}

/// Refresh liveness; re-attach if the room expired under a live connection
fn keep_alive(state: &AppState, id: &ParticipantId, room: &RoomName, tx: &PushSender) {
    if !state.registry.record_liveness(id) {
        debug!("Re-attaching {} to expired room {}", id, room);
        state.registry.join(id, room, tx.clone());
    }
}
