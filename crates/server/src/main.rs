use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    advance_participant, create_session, join_session, participant_progress, record_live_event,
    session_overview, ApiContext,
};
use shared::{
    error::{ApiError, ApiException, ErrorCode},
    protocol::{MonitorEvent, ParticipantSummary, SessionOverview, SessionSummary},
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<MonitorEvent>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinSessionRequest {
    session_code: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayQuery {
    participant_code: String,
}

const MAX_BODY_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let (events, _) = broadcast::channel(settings.monitor_buffer);

    let state = AppState { api, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(http_create_session))
        .route("/sessions/join", post(http_join_session))
        .route("/sessions/:session_code", get(http_session_overview))
        .route(
            "/participants/:participant_code",
            get(http_participant_progress),
        )
        .route(
            "/participants/:participant_code/advance",
            post(http_advance_participant),
        )
        .route("/ws/play", get(ws_play_handler))
        .route("/ws/monitor", get(ws_monitor_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_response(exception: ApiException) -> (StatusCode, Json<ApiError>) {
    let status = match exception.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError::from(exception)))
}

async fn http_create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionSummary>, (StatusCode, Json<ApiError>)> {
    let session = create_session(&state.api, req.label.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(session))
}

async fn http_join_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Json<ParticipantSummary>, (StatusCode, Json<ApiError>)> {
    let participant = join_session(&state.api, &req.session_code, req.label.as_deref())
        .await
        .map_err(error_response)?;
    let _ = state.events.send(MonitorEvent::ParticipantJoined {
        participant: participant.clone(),
    });
    Ok(Json(participant))
}

async fn http_session_overview(
    State(state): State<Arc<AppState>>,
    Path(session_code): Path<String>,
) -> Result<Json<SessionOverview>, (StatusCode, Json<ApiError>)> {
    let overview = session_overview(&state.api, &session_code)
        .await
        .map_err(error_response)?;
    Ok(Json(overview))
}

async fn http_participant_progress(
    State(state): State<Arc<AppState>>,
    Path(participant_code): Path<String>,
) -> Result<Json<ParticipantSummary>, (StatusCode, Json<ApiError>)> {
    let participant = participant_progress(&state.api, &participant_code)
        .await
        .map_err(error_response)?;
    Ok(Json(participant))
}

async fn http_advance_participant(
    State(state): State<Arc<AppState>>,
    Path(participant_code): Path<String>,
) -> Result<Json<ParticipantSummary>, (StatusCode, Json<ApiError>)> {
    let (participant, event) = advance_participant(&state.api, &participant_code)
        .await
        .map_err(error_response)?;
    if let Some(event) = event {
        let _ = state.events.send(event);
    }
    Ok(Json(participant))
}

async fn ws_play_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PlayQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let participant = participant_progress(&state.api, &q.participant_code)
        .await
        .map_err(error_response)?;
    Ok(ws.on_upgrade(move |socket| play_connection(state, socket, participant)))
}

/// Inbound half of a participant's live channel.
///
/// Text frames are event payloads; recognized tokens update the counters and
/// fan out to the monitor stream. Nothing is ever sent back on this socket,
/// and an unrecognized payload is indistinguishable from a successful no-op.
async fn play_connection(
    state: Arc<AppState>,
    mut socket: axum::extract::ws::WebSocket,
    participant: ParticipantSummary,
) {
    use axum::extract::ws::Message;

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(raw) = message else {
            continue;
        };
        match record_live_event(
            &state.api,
            participant.session_id,
            participant.participant_id,
            &raw,
        )
        .await
        {
            Ok(Some(event)) => {
                let _ = state.events.send(event);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    participant = participant.participant_id.0,
                    %error,
                    "failed to record live event"
                );
            }
        }
    }
}

async fn ws_monitor_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| monitor_connection(state, socket))
}

async fn monitor_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "monitor subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
