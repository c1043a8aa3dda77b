// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The UI reads the chart frame and chat
// log from here and feeds back the two inputs the sessions take: the active
// symbol and outgoing chat messages.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::error::ChannelError;
use crate::types::ChatSendMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/chart", get(chart))
        .route("/api/v1/chat", get(chat_log).post(send_chat))
        .route("/api/v1/chat/mode", post(set_chat_mode))
        .route("/api/v1/symbol", post(select_symbol))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(error: &ChannelError) -> ApiError {
    let status = match error {
        ChannelError::Address(_) => StatusCode::BAD_REQUEST,
        ChannelError::SendFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ChannelError::NotOpen | ChannelError::ClosedByPeer => StatusCode::CONFLICT,
        ChannelError::Connect { .. } | ChannelError::Transport(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(serde_json::json!({ "error": error.to_string() })))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Read side
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

/// Full series for the renderer; it redraws from scratch on every fetch.
async fn chart(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.chart_frame())
}

async fn chat_log(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.chat_log())
}

// =============================================================================
// Inputs
// =============================================================================

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

#[derive(Serialize)]
struct SymbolResponse {
    symbol: String,
}

async fn select_symbol(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> Result<Json<SymbolResponse>, ApiError> {
    let symbol = state.select_symbol(&req.symbol).map_err(|e| api_error(&e))?;
    info!(symbol = %symbol, "symbol selected via API");
    Ok(Json(SymbolResponse { symbol }))
}

#[derive(Deserialize)]
struct ChatRequest {
    text: String,
}

async fn send_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.send_chat(req.text).await.map_err(|e| {
        debug!(error = %e, "chat message refused");
        api_error(&e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "sent" }))))
}

#[derive(Deserialize)]
struct ChatModeRequest {
    mode: String,
}

#[derive(Serialize)]
struct ChatModeResponse {
    mode: ChatSendMode,
}

/// `persistent` or `short_lived`; applies to the next message sent.
async fn set_chat_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatModeRequest>,
) -> Result<Json<ChatModeResponse>, ApiError> {
    let mode: ChatSendMode = req.mode.trim().parse().map_err(|e: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e })),
        )
    })?;
    state.set_chat_mode(mode).map_err(|e| api_error(&e))?;
    info!(mode = %mode, "chat send mode selected via API");
    Ok(Json(ChatModeResponse { mode }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::testing::harness;
    use crate::session::ChatCommand;

    #[tokio::test]
    async fn symbol_selection_validates_input() {
        let h = harness();

        let ok = select_symbol(
            State(h.state.clone()),
            Json(SymbolRequest {
                symbol: " AAPL ".into(),
            }),
        )
        .await;
        assert_eq!(ok.map(|Json(r)| r.symbol).ok().as_deref(), Some("AAPL"));
        assert_eq!(h.state.current_symbol(), "AAPL");

        let bad = select_symbol(
            State(h.state.clone()),
            Json(SymbolRequest { symbol: "".into() }),
        )
        .await;
        assert_eq!(bad.err().map(|(code, _)| code), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn chat_post_maps_session_verdict() {
        let mut h = harness();
        let state = h.state.clone();
        let post = tokio::spawn(async move {
            send_chat(State(state), Json(ChatRequest { text: "hi".into() }))
                .await
                .into_response()
        });

        let Some(ChatCommand::Send { reply, .. }) = h.chat_cmd_rx.recv().await else {
            panic!("expected a send command");
        };
        reply.send(Err(ChannelError::NotOpen)).unwrap();
        assert_eq!(post.await.unwrap().status(), StatusCode::CONFLICT);

        let state = h.state.clone();
        let post = tokio::spawn(async move {
            send_chat(State(state), Json(ChatRequest { text: "hi".into() }))
                .await
                .into_response()
        });
        let Some(ChatCommand::Send { reply, .. }) = h.chat_cmd_rx.recv().await else {
            panic!("expected a send command");
        };
        reply.send(Ok(())).unwrap();
        assert_eq!(post.await.unwrap().status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn chat_mode_switch_parses_and_forwards() {
        let mut h = harness();

        let ok = set_chat_mode(
            State(h.state.clone()),
            Json(ChatModeRequest {
                mode: "short-lived".into(),
            }),
        )
        .await;
        assert_eq!(
            ok.map(|Json(r)| r.mode).ok(),
            Some(ChatSendMode::ShortLived)
        );
        assert!(matches!(
            h.chat_cmd_rx.try_recv(),
            Ok(ChatCommand::SetMode(ChatSendMode::ShortLived))
        ));

        let bad = set_chat_mode(
            State(h.state.clone()),
            Json(ChatModeRequest {
                mode: "carrier pigeon".into(),
            }),
        )
        .await;
        assert_eq!(bad.err().map(|(code, _)| code), Some(StatusCode::BAD_REQUEST));
        assert!(h.chat_cmd_rx.try_recv().is_err());

        drop(h.chat_cmd_rx);
        let gone = set_chat_mode(
            State(h.state.clone()),
            Json(ChatModeRequest {
                mode: "persistent".into(),
            }),
        )
        .await;
        assert_eq!(
            gone.err().map(|(code, _)| code),
            Some(StatusCode::UNPROCESSABLE_ENTITY)
        );
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            api_error(&ChannelError::SendFailed("message is empty".into())).0,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            api_error(&ChannelError::Transport("reset".into())).0,
            StatusCode::BAD_GATEWAY
        );
    }
}
