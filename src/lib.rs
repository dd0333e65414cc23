pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod persona;
pub mod realtime;

pub use audio::{AudioFrame, PlaybackBuffer, WavInput};
pub use config::Config;
pub use conversation::{
    ConversationStateMachine, Dialogue, DialogueDeps, DialogueSettings, DialogueView, EndSummary,
    Position, SpeechState, Turn,
};
pub use error::{ConnectFailure, DeviceError, DialogueError, RemoteErrorKind, SendError};
pub use http::{create_router, AppState};
pub use persona::Persona;
pub use realtime::{ConnectionManager, ConnectionState, WebSocketConnector};
