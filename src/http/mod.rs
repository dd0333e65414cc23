//! HTTP API for driving a conversation from another process
//!
//! - POST /conversation/start - Start talking to a persona
//! - POST /conversation/text - Type a message
//! - POST /conversation/speech-mode - Toggle speech mode
//! - POST /conversation/interrupt - Stop the agent mid-response
//! - POST /conversation/end - End the conversation
//! - GET /conversation/status - Caption and flags
//! - GET /conversation/transcript - Turn log
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
