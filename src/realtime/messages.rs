//! Wire messages for the realtime session (OpenAI Realtime v1 JSON)

use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::error::RemoteErrorKind;

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub mode: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            mode: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// Both modalities, as every response in this pipeline requests
pub const TEXT_AND_AUDIO: [Modality; 2] = [Modality::Text, Modality::Audio];

/// One-time session configuration sent on every connection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub turn_detection: TurnDetection,
    pub modalities: Vec<Modality>,
    pub voice: String,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOptions {
    pub modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Commands sent to the remote agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    CommitInput,

    #[serde(rename = "response.create")]
    CreateResponse { response: ResponseOptions },

    #[serde(rename = "response.cancel")]
    CancelResponse,

    #[serde(rename = "conversation.item.create")]
    CreateUserMessage { item: ConversationItem },
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: String,
    #[serde(flatten)]
    command: &'a ClientCommand,
}

impl ClientCommand {
    pub fn append_audio(frame: &AudioFrame) -> Self {
        ClientCommand::AppendAudio {
            audio: frame.to_base64(),
        }
    }

    pub fn create_response(instructions: Option<String>) -> Self {
        ClientCommand::CreateResponse {
            response: ResponseOptions {
                modalities: TEXT_AND_AUDIO.to_vec(),
                instructions,
            },
        }
    }

    pub fn user_message(text: impl Into<String>) -> Self {
        ClientCommand::CreateUserMessage {
            item: ConversationItem {
                kind: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart {
                    kind: "input_text".to_string(),
                    text: text.into(),
                }],
            },
        }
    }

    /// Wire type name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::SessionUpdate { .. } => "session.update",
            ClientCommand::AppendAudio { .. } => "input_audio_buffer.append",
            ClientCommand::CommitInput => "input_audio_buffer.commit",
            ClientCommand::CreateResponse { .. } => "response.create",
            ClientCommand::CancelResponse => "response.cancel",
            ClientCommand::CreateUserMessage { .. } => "conversation.item.create",
        }
    }

    /// Serialize with a fresh client event id
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            command: self,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
}

/// Error payload of an inbound `error` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    /// Classify by the structured `code`; the message is only consulted when
    /// the server omits the code
    pub fn classify(&self) -> RemoteErrorKind {
        match self.code.as_deref() {
            Some("response_cancel_not_active") => RemoteErrorKind::CancelNotActive,
            // Server VAD commits and responds on its own; our explicit
            // commit and response.create can lose that race
            Some("input_audio_buffer_commit_empty")
            | Some("conversation_already_has_active_response") => RemoteErrorKind::Transient,
            Some(_) => RemoteErrorKind::Fatal,
            None if self.message.contains("no active response") => {
                RemoteErrorKind::CancelNotActive
            }
            None => RemoteErrorKind::Fatal,
        }
    }
}

/// Inbound events consumed by the conversation state machine
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { item_id: String, delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { item_id: String, delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        item_id: String,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(
        rename = "input_audio_buffer.speech_stopped",
        alias = "input_audio_buffer.speech_done"
    )]
    SpeechStopped,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error { error: RemoteError },

    #[serde(other)]
    Unknown,
}
