use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    auth::IdentityResolver,
    broker::{ClientEvent, ConnectionId, RoomBroker, ServerEvent},
    chat::{ChatMessage, MarkReadRequest, NewMessage, PatientSummary, SendMessageRequest},
    conversation,
    entity::{Participant, Profile, Role},
    error::{ChatError, Result},
    store::Store,
};

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub store: Store,
    pub broker: Arc<RoomBroker>,
    pub auth: IdentityResolver,
}

impl AppState {
    pub fn new(store: Store, broker: Arc<RoomBroker>, auth: IdentityResolver) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            auth,
        })
    }
}

/// Build the REST + realtime router. `allowed_origins` restricts CORS to the
/// portal front-ends; an empty list allows any origin.
pub fn router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(|| async { "API WORKING" }))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/mark-read", post(mark_read))
        .route("/api/messages/doctor/:doctor_id/patients", get(doctor_patients))
        .route("/api/messages/:user_id/:doctor_id", get(get_messages))
        .route("/api/profiles", put(save_profile))
        .route("/api/profiles/:id", get(get_profile))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin {origin}: {e}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

// -----------------------------------------------------------------------------
// REST
// -----------------------------------------------------------------------------

async fn send_message(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>)> {
    let Json(request) = payload.map_err(|e| ChatError::Validation(e.body_text()))?;
    let new = NewMessage::try_from(request)?;

    let stored = state.store.send(&new).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// History between the two ids. Also acknowledges everything `user_id` sent
/// to `doctor_id`, which is what both portals expect from opening a chat.
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path((user_id, doctor_id)): Path<(String, String)>,
) -> Result<Json<Vec<ChatMessage>>> {
    state.store.require_profile(&user_id).await?;
    state.store.require_profile(&doctor_id).await?;

    let history = state.store.history(&user_id, &doctor_id).await?;
    state.store.mark_read(&doctor_id, &user_id).await?;

    Ok(Json(history))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<MarkReadRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let Json(request) = payload.map_err(|e| ChatError::Validation(e.body_text()))?;
    if request.user_id.is_empty() || request.doctor_id.is_empty() {
        return Err(ChatError::Validation("userId and doctorId are required".into()));
    }

    state
        .store
        .mark_read(&request.doctor_id, &request.user_id)
        .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn doctor_patients(
    State(state): State<Arc<AppState>>,
    Path(doctor_id): Path<String>,
) -> Result<Json<Vec<PatientSummary>>> {
    let patients = conversation::patients_for_doctor(&state.store, &doctor_id).await?;
    Ok(Json(patients))
}

async fn save_profile(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Profile>, JsonRejection>,
) -> Result<Json<Profile>> {
    let Json(profile) = payload.map_err(|e| ChatError::Validation(e.body_text()))?;
    if profile.id.trim().is_empty() || profile.name.trim().is_empty() {
        return Err(ChatError::Validation("id and name are required".into()));
    }

    state.store.save_profile(&profile).await?;
    Ok(Json(profile))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Profile>> {
    Ok(Json(state.store.require_profile(&id).await?))
}

// -----------------------------------------------------------------------------
// Realtime
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub token: String,
    pub role: Role,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    handshake: std::result::Result<Query<Handshake>, QueryRejection>,
) -> Result<Response> {
    let Query(handshake) = handshake.map_err(|e| ChatError::Unauthorized(e.body_text()))?;
    let identity = state.auth.resolve(&handshake.token, handshake.role)?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Participant) {
    let (connection, mut events) = state.broker.connect(identity.clone());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound: broker events to the socket. Ends once the broker drops the
    // connection's sender on disconnect.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode realtime event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = ws_receiver.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => {
                debug!(connection, "WebSocket close received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(e) = handle_client_event(&state, connection, &identity, &text).await {
            reject(&state, connection, &identity, e);
        }
    }

    state.broker.disconnect(connection);
    if let Err(e) = writer.await {
        warn!(connection, "Realtime writer task failed: {}", e);
    }
    info!(connection, identity = %identity, "Realtime session finished");
}

/// Report a failed realtime request back to the connection that made it.
pub fn reject(state: &AppState, connection: ConnectionId, identity: &Participant, e: ChatError) {
    warn!(connection, identity = %identity, "Rejected realtime request: {}", e);

    let message = if e.status().is_server_error() {
        "Internal server error".to_string()
    } else {
        e.to_string()
    };
    state
        .broker
        .notify(connection, ServerEvent::Error { message });
}

async fn handle_client_event(
    state: &AppState,
    connection: ConnectionId,
    identity: &Participant,
    text: &str,
) -> Result<()> {
    let event: ClientEvent = serde_json::from_str(text)
        .map_err(|e| ChatError::Validation(format!("malformed event: {e}")))?;

    dispatch(state, connection, identity, event).await
}

/// Apply one realtime request from `connection`, acting as `identity`.
pub async fn dispatch(
    state: &AppState,
    connection: ConnectionId,
    identity: &Participant,
    event: ClientEvent,
) -> Result<()> {
    match event {
        ClientEvent::JoinRoom(join) => {
            let room = state
                .broker
                .join(connection, &join.user_id, &join.doctor_id)?;
            state.broker.notify(
                connection,
                ServerEvent::Joined {
                    room: room.to_string(),
                },
            );
        }
        ClientEvent::SendMessage(message) => {
            if message.sender() != *identity {
                return Err(ChatError::Forbidden(format!(
                    "{identity} cannot publish on behalf of {}",
                    message.sender()
                )));
            }

            // Broadcast the canonical stored record, never the client's copy.
            let stored = state
                .store
                .message(&message.id)
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message.id)))?;

            state.broker.publish(&stored);
        }
    }

    Ok(())
}
