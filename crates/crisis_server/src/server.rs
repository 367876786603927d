use crate::ServerConfig;
use crate::engine::{ConnectionId, Engine, EngineError, EngineHandle, SessionEvent};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, Query, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use crisis_api::{
    ErrorResponse, HealthResponse, MAX_BODY_BYTES, PROTOCOL_VERSION, ResetResponse,
    ResourceListResponse, SaveStateRequest, StateResponse, TimelineResponse, WsClientMessage,
    WsServerMessage,
};
use crisis_backend::{SessionRepository, open_store};
use crisis_domain::time::now_unix_ms;
use crisis_domain::{
    LoadSource, RESOURCE_MAX_BYTES, ResourceUpload, SessionId, export_file_name, export_json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

// Room for multipart framing around a maximum-size file.
const RESOURCE_UPLOAD_LIMIT: usize = RESOURCE_MAX_BYTES + 64 * 1024;

pub fn router(config: &ServerConfig) -> anyhow::Result<Router> {
    let store = open_store(&config.store)?;
    let (engine, events) = Engine::start(SessionRepository::new(store));

    let state = AppStateHolder {
        engine,
        events,
        next_connection: Arc::new(AtomicU64::new(1)),
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state).post(post_state))
        .route("/state/{session_id}", delete(delete_state))
        .route("/state/{session_id}/reset", post(reset_state))
        .route("/export", get(export_state))
        .route("/timeline", get(get_timeline))
        .route(
            "/resources/{session_id}",
            post(upload_resource)
                .get(list_resources)
                .layer(DefaultBodyLimit::max(RESOURCE_UPLOAD_LIMIT)),
        )
        .route(
            "/resources/{session_id}/{resource_id}",
            get(download_resource),
        )
        .route("/events", get(ws_events))
        .with_state(state);

    let web_index = config.web_dist_dir.join("index.html");
    let web = ServeDir::new(&config.web_dist_dir).not_found_service(ServeFile::new(web_index));

    Ok(Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .fallback_service(web)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

#[derive(Clone)]
struct AppStateHolder {
    engine: EngineHandle,
    events: broadcast::Sender<SessionEvent>,
    next_connection: Arc<AtomicU64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_owned(),
        protocol_version: PROTOCOL_VERSION,
    })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn engine_error(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Invalid(_) => StatusCode::BAD_REQUEST,
        EngineError::Conflict { .. } => StatusCode::CONFLICT,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, err.to_string())
}

fn parse_session(raw: Option<&str>) -> Result<SessionId, Response> {
    let Some(raw) = raw else {
        return Err(error_response(StatusCode::BAD_REQUEST, "missing sessionId"));
    };
    SessionId::parse(raw).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, format!("invalid sessionId: {raw:?}"))
    })
}

async fn get_state(
    State(state): State<AppStateHolder>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let session_id = match parse_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.load(session_id.clone()).await {
        Ok(outcome) => Json(StateResponse {
            session_id,
            exists: outcome.source == LoadSource::Stored,
            state: outcome.state,
        })
        .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn post_state(
    State(state): State<AppStateHolder>,
    payload: Result<Json<SaveStateRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };
    match state
        .engine
        .save(
            request.session_id,
            request.state,
            request.base_version,
            request.client_op_id,
            None,
        )
        .await
    {
        Ok(ack) => Json(ack).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn delete_state(
    State(state): State<AppStateHolder>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = match parse_session(Some(&session_id)) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.delete(session_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => engine_error(err),
    }
}

async fn reset_state(
    State(state): State<AppStateHolder>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = match parse_session(Some(&session_id)) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.reset(session_id).await {
        Ok(session_id) => Json(ResetResponse { session_id }).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn export_state(
    State(state): State<AppStateHolder>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let session_id = match parse_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let outcome = match state.engine.load(session_id).await {
        Ok(outcome) => outcome,
        Err(err) => return engine_error(err),
    };

    let file_name = export_file_name(now_unix_ms());
    (
        [
            (
                header::CONTENT_TYPE,
                "application/json; charset=utf-8".to_owned(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        export_json(&outcome.state),
    )
        .into_response()
}

async fn get_timeline(
    State(state): State<AppStateHolder>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let session_id = match parse_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.load(session_id.clone()).await {
        Ok(outcome) => Json(TimelineResponse {
            session_id,
            records: outcome.state.rida_timeline(),
        })
        .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn upload_resource(
    State(state): State<AppStateHolder>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let session_id = match parse_session(Some(&session_id)) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return error_response(err.status(), err.body_text()),
        };
        if field.name() != Some("file") {
            continue;
        }
        file_name = field.file_name().map(|s| s.to_owned());
        content_type = field.content_type().map(|m| m.to_string());
        match field.bytes().await {
            Ok(bytes) => file_bytes = Some(bytes.to_vec()),
            Err(err) => return error_response(err.status(), err.body_text()),
        }
    }

    let Some(bytes) = file_bytes else {
        return error_response(StatusCode::BAD_REQUEST, "missing multipart field: file");
    };
    if bytes.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "resource is empty");
    }
    if bytes.len() > RESOURCE_MAX_BYTES {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("resource exceeds {RESOURCE_MAX_BYTES} bytes"),
        );
    }

    let uploaded_at_ms = now_unix_ms();
    let name = append_timestamp_to_basename(
        file_name.as_deref().unwrap_or("resource"),
        uploaded_at_ms,
    );
    let upload = ResourceUpload {
        name,
        mime: content_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
        bytes,
        created_at_unix_ms: uploaded_at_ms,
    };

    match state.engine.store_resource(session_id, upload).await {
        Ok(resource) => (StatusCode::CREATED, Json(resource)).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn list_resources(
    State(state): State<AppStateHolder>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = match parse_session(Some(&session_id)) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.list_resources(session_id.clone()).await {
        Ok(resources) => Json(ResourceListResponse {
            session_id,
            resources,
        })
        .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn download_resource(
    State(state): State<AppStateHolder>,
    Path((session_id, resource_id)): Path<(String, String)>,
) -> Response {
    let session_id = match parse_session(Some(&session_id)) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.load_resource(session_id, resource_id).await {
        Ok(Some((resource, bytes))) => (
            [
                (header::CONTENT_TYPE, resource.mime),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{}\"", resource.name.replace('"', "")),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "resource not found"),
        Err(err) => engine_error(err),
    }
}

fn append_timestamp_to_basename(name: &str, unix_ms: u64) -> String {
    let raw_name = std::path::Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .trim();

    let path = std::path::Path::new(raw_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("resource");
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{stem}-{unix_ms}.{ext}"),
        _ => format!("{stem}-{unix_ms}"),
    }
}

async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<AppStateHolder>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let session_id = match parse_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    ws.on_upgrade(move |socket| ws_events_task(socket, state, session_id))
}

async fn ws_events_task(mut socket: WebSocket, state: AppStateHolder, session_id: SessionId) {
    let connection_id: ConnectionId = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let mut rx = state.events.subscribe();
    let engine = state.engine.clone();
    tracing::debug!(session_id = %session_id, connection_id, "realtime client connected");

    if send_snapshot(&mut socket, &engine, &session_id, true, None)
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                if handle_ws_incoming(msg, &engine, &session_id, connection_id, &mut socket)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(event) => {
                        if event.session_id != session_id || event.origin == Some(connection_id) {
                            continue;
                        }
                        let msg = WsServerMessage::StateChanged {
                            session_id: event.session_id,
                            state: Box::new(event.state),
                        };
                        if socket.send(json_text(&msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session_id, skipped, "realtime client lagged, resyncing");
                        if send_snapshot(&mut socket, &engine, &session_id, false, None)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!(session_id = %session_id, connection_id, "realtime client disconnected");
}

fn json_text<T: serde::Serialize>(value: &T) -> Message {
    Message::Text(serde_json::to_string(value).unwrap_or_default().into())
}

async fn send_snapshot(
    socket: &mut WebSocket,
    engine: &EngineHandle,
    session_id: &SessionId,
    hello: bool,
    known_version: Option<u64>,
) -> anyhow::Result<()> {
    let msg = match engine.load(session_id.clone()).await {
        // The client already holds this version.
        Ok(outcome) if known_version == Some(outcome.state.meta.version) => return Ok(()),
        Ok(outcome) if hello => WsServerMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
            state: Box::new(outcome.state),
        },
        Ok(outcome) => WsServerMessage::StateChanged {
            session_id: session_id.clone(),
            state: Box::new(outcome.state),
        },
        Err(err) => WsServerMessage::Error {
            request_id: None,
            message: err.to_string(),
        },
    };
    socket.send(json_text(&msg)).await?;
    Ok(())
}

async fn handle_ws_incoming(
    msg: Message,
    engine: &EngineHandle,
    session_id: &SessionId,
    connection_id: ConnectionId,
    socket: &mut WebSocket,
) -> anyhow::Result<()> {
    let Message::Text(text) = msg else {
        return Ok(());
    };

    let client: WsClientMessage = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(err) => {
            socket
                .send(json_text(&WsServerMessage::Error {
                    request_id: None,
                    message: format!("invalid ws message: {err}"),
                }))
                .await?;
            return Ok(());
        }
    };

    let (request_id, result) = match client {
        WsClientMessage::Hello {
            protocol_version,
            last_seen_version,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                socket
                    .send(json_text(&WsServerMessage::Error {
                        request_id: None,
                        message: format!(
                            "unsupported protocol version {protocol_version} (server speaks {PROTOCOL_VERSION})"
                        ),
                    }))
                    .await?;
                return Ok(());
            }
            return send_snapshot(socket, engine, session_id, false, last_seen_version).await;
        }
        WsClientMessage::Ping => {
            socket.send(json_text(&WsServerMessage::Pong)).await?;
            return Ok(());
        }
        WsClientMessage::Submit {
            request_id,
            state,
            base_version,
            client_op_id,
        } => {
            let result = engine
                .save(
                    session_id.clone(),
                    state,
                    base_version,
                    client_op_id,
                    Some(connection_id),
                )
                .await;
            (request_id, result)
        }
        WsClientMessage::Reset { request_id } => {
            let result = engine.clear(session_id.clone(), Some(connection_id)).await;
            (request_id, result)
        }
        WsClientMessage::Import {
            request_id,
            document,
        } => {
            let result = engine
                .import(session_id.clone(), document.to_string(), Some(connection_id))
                .await;
            (request_id, result)
        }
    };

    let reply = match result {
        Ok(ack) => WsServerMessage::Ack {
            request_id,
            version: ack.version,
            updated_at: ack.updated_at,
        },
        Err(err) => WsServerMessage::Error {
            request_id: Some(request_id),
            message: err.to_string(),
        },
    };
    socket.send(json_text(&reply)).await?;
    Ok(())
}
