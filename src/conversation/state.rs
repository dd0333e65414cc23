use serde::{Deserialize, Serialize};

use super::transcript::Turn;

/// Who currently holds the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechState {
    #[default]
    Idle,
    UserSpeaking,
    AgentResponding,
    Cancelling,
}

/// Where the user stood when the conversation started
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.5,
            z: 0.0,
        }
    }
}

/// Snapshot published to the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DialogueView {
    pub active: bool,
    pub speech_mode: bool,
    /// Realtime session configured and accepting sends
    pub session_ready: bool,
    pub speech_state: SpeechState,
    /// Text to show for the agent; live while a response streams
    pub caption: String,
    /// Persona key of the current conversation
    pub persona: Option<String>,
    pub turns: Vec<Turn>,
}

/// Returned from `Dialogue::end`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EndSummary {
    pub return_position: Position,
}
