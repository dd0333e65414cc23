use super::state::AppState;
use crate::conversation::{Position, SpeechState, Turn};
use crate::error::DialogueError;
use crate::persona::Persona;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    /// Persona key ("hr" or "ceo")
    pub persona: String,

    /// Where the user stood; returned from /conversation/end
    pub position: Option<Position>,
}

#[derive(Debug, Serialize)]
pub struct StartConversationResponse {
    pub persona: String,
    pub status: String,
    pub greeting: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTextRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SpeechModeResponse {
    pub speech_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct EndConversationResponse {
    pub status: String,
    pub return_position: Position,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub active: bool,
    pub speech_mode: bool,
    pub session_ready: bool,
    pub speech_state: SpeechState,
    pub caption: String,
    pub persona: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn not_active(e: DialogueError) -> Response {
    error_response(StatusCode::CONFLICT, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /conversation/start
/// Start a conversation, replacing any live one
pub async fn start_conversation(
    State(state): State<AppState>,
    Json(req): Json<StartConversationRequest>,
) -> impl IntoResponse {
    let Some(persona) = Persona::builtin(&req.persona) else {
        warn!("Unknown persona requested: {}", req.persona);
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Unknown persona {} (expected one of: {})",
                req.persona,
                Persona::builtin_keys().join(", ")
            ),
        );
    };

    info!("Starting conversation with {}", persona.name);

    let response = StartConversationResponse {
        persona: persona.key.clone(),
        status: "active".to_string(),
        greeting: persona.greeting.clone(),
    };

    state.dialogue.start(persona, req.position).await;

    (StatusCode::OK, Json(response)).into_response()
}

/// POST /conversation/text
/// Type a message to the agent
pub async fn submit_text(
    State(state): State<AppState>,
    Json(req): Json<SubmitTextRequest>,
) -> impl IntoResponse {
    if req.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Text must not be empty");
    }

    match state.dialogue.submit_text(req.text).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => not_active(e),
    }
}

/// POST /conversation/speech-mode
/// Toggle speech mode
pub async fn toggle_speech_mode(State(state): State<AppState>) -> impl IntoResponse {
    match state.dialogue.toggle_speech_mode().await {
        Ok(speech_mode) => {
            info!("Speech mode toggled: {}", speech_mode);
            (StatusCode::OK, Json(SpeechModeResponse { speech_mode })).into_response()
        }
        Err(e) => not_active(e),
    }
}

/// POST /conversation/interrupt
/// Stop the agent mid-response
pub async fn interrupt(State(state): State<AppState>) -> impl IntoResponse {
    match state.dialogue.interrupt().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => not_active(e),
    }
}

/// POST /conversation/end
/// End the conversation
pub async fn end_conversation(State(state): State<AppState>) -> impl IntoResponse {
    match state.dialogue.end().await {
        Some(summary) => (
            StatusCode::OK,
            Json(EndConversationResponse {
                status: "ended".to_string(),
                return_position: summary.return_position,
            }),
        )
            .into_response(),
        None => not_active(DialogueError::NotActive),
    }
}

/// GET /conversation/status
/// Caption and mode flags, without the turn log
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.dialogue.view();

    Json(StatusResponse {
        active: view.active,
        speech_mode: view.speech_mode,
        session_ready: view.session_ready,
        speech_state: view.speech_state,
        caption: view.caption,
        persona: view.persona,
    })
}

/// GET /conversation/transcript
/// Turn log so far
pub async fn get_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let turns: Vec<Turn> = state.dialogue.view().turns;
    (StatusCode::OK, Json(turns))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
