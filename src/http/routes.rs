use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Conversation control
        .route("/conversation/start", post(handlers::start_conversation))
        .route("/conversation/text", post(handlers::submit_text))
        .route("/conversation/speech-mode", post(handlers::toggle_speech_mode))
        .route("/conversation/interrupt", post(handlers::interrupt))
        .route("/conversation/end", post(handlers::end_conversation))
        // Queries
        .route("/conversation/status", get(handlers::get_status))
        .route("/conversation/transcript", get(handlers::get_transcript))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
