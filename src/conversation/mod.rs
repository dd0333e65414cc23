pub mod dialogue;
pub mod fallback;
pub mod machine;
pub mod state;
pub mod transcript;

pub use dialogue::{Dialogue, DialogueDeps, DialogueSettings, InputOpener, OutputOpener};
pub use fallback::{ChatBackend, ChatCompletions, ChatCompletionsConfig, APOLOGY};
pub use machine::{ConversationStateMachine, Flow, TextRoute, SPEECH_PLACEHOLDER};
pub use state::{DialogueView, EndSummary, Position, SpeechState};
pub use transcript::{Role, TranscriptAccumulator, Turn, TurnLog};
