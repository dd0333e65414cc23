// Conversation state machine
//
// Consumes inbound realtime events strictly one at a time and reconciles
// them with local actions (typed text, explicit stop, speech toggling). It is
// the only writer of speech state, the transcript and the playback queue.
// Remote commands are fire-and-forget: local state never waits for them.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::fallback::APOLOGY;
use super::state::{DialogueView, SpeechState};
use super::transcript::{TranscriptAccumulator, Turn, TurnLog};
use crate::audio::{AudioFrame, PlaybackBuffer};
use crate::error::{ConnectFailure, DeviceError, RemoteErrorKind};
use crate::persona::Persona;
use crate::realtime::{ClientCommand, ConnectionManager, ServerEvent};

/// Placeholder user turn logged when the remote detects speech
pub const SPEECH_PLACEHOLDER: &str = "[Speech input started]";

/// Whether the event loop should keep reading the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// How a typed message was dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum TextRoute {
    /// Blank input
    Ignored,
    /// Sent over the realtime session
    Streamed,
    /// Needs a single-shot reply for this conversation
    Fallback(Vec<Turn>),
}

pub struct ConversationStateMachine {
    connection: Arc<ConnectionManager>,
    playback: PlaybackBuffer,
    persona: String,
    transcripts: TranscriptAccumulator,
    turns: TurnLog,
    speech: SpeechState,
    /// Assistant item currently streaming; set iff AgentResponding
    active_item: Option<String>,
    /// Item the queued audio belongs to
    playback_item: Option<String>,
    /// Frames enqueued for `playback_item`
    item_frames: u64,
    /// Last response cancelled by barge-in; its late deltas are dropped
    cancelled_item: Option<String>,
    session_ready: bool,
    speech_mode: bool,
    caption: String,
    pending_greeting: Option<String>,
}

impl ConversationStateMachine {
    pub fn new(connection: Arc<ConnectionManager>, playback: PlaybackBuffer, persona: &Persona) -> Self {
        Self {
            connection,
            playback,
            persona: persona.key.clone(),
            transcripts: TranscriptAccumulator::new(),
            turns: TurnLog::new(persona.system_prompt()),
            speech: SpeechState::Idle,
            active_item: None,
            playback_item: None,
            item_frames: 0,
            cancelled_item: None,
            session_ready: false,
            speech_mode: false,
            caption: persona.greeting.clone(),
            pending_greeting: Some(persona.greeting.clone()),
        }
    }

    pub fn speech_state(&self) -> SpeechState {
        self.speech
    }

    pub fn speech_mode(&self) -> bool {
        self.speech_mode
    }

    pub fn session_ready(&self) -> bool {
        self.session_ready
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn turns(&self) -> &[Turn] {
        self.turns.turns()
    }

    pub fn playback(&self) -> &PlaybackBuffer {
        &self.playback
    }

    pub fn item_frames(&self) -> u64 {
        self.item_frames
    }

    pub fn active_item(&self) -> Option<&str> {
        self.active_item.as_deref()
    }

    pub fn view(&self, active: bool) -> DialogueView {
        DialogueView {
            active,
            speech_mode: self.speech_mode,
            session_ready: self.session_ready,
            speech_state: self.speech,
            caption: self.caption.clone(),
            persona: Some(self.persona.clone()),
            turns: self.turns.turns().to_vec(),
        }
    }

    /// Bring a published view up to date; returns whether anything changed
    ///
    /// The turn log only grows, so only turns the view has not seen yet are
    /// copied.
    pub fn refresh(&self, view: &mut DialogueView) -> bool {
        let mut changed = update(&mut view.active, true);
        changed |= update(&mut view.speech_mode, self.speech_mode);
        changed |= update(&mut view.session_ready, self.session_ready);
        changed |= update(&mut view.speech_state, self.speech);

        if view.caption != self.caption {
            view.caption.clone_from(&self.caption);
            changed = true;
        }

        if view.persona.as_deref() != Some(self.persona.as_str()) {
            view.persona = Some(self.persona.clone());
            changed = true;
        }

        let turns = self.turns.turns();
        if view.turns.len() < turns.len() {
            let seen = view.turns.len();
            view.turns.extend_from_slice(&turns[seen..]);
            changed = true;
        } else if view.turns.len() > turns.len() {
            view.turns = turns.to_vec();
            changed = true;
        }

        changed
    }

    /// Apply one inbound event
    pub fn handle_event(&mut self, event: ServerEvent) -> Flow {
        match event {
            ServerEvent::SessionCreated { session } => {
                info!("Realtime session created: {}", session.id);
            }
            ServerEvent::SessionUpdated => {
                info!("Realtime session configured");
                self.session_ready = true;

                if let Some(greeting) = self.pending_greeting.take() {
                    info!("Sending greeting");
                    self.send(ClientCommand::create_response(Some(greeting)));
                }
            }
            ServerEvent::AudioDelta { item_id, delta } => self.on_audio_delta(item_id, &delta),
            ServerEvent::TranscriptDelta { item_id, delta } => {
                if self.is_cancelled(&item_id) {
                    return Flow::Continue;
                }
                self.begin_response(&item_id);
                self.caption = self.transcripts.append(&item_id, &delta).to_string();
            }
            ServerEvent::TranscriptDone { item_id, transcript } => {
                let accumulated = self.transcripts.finalize(&item_id);
                if self.is_cancelled(&item_id) {
                    return Flow::Continue;
                }

                let text = if accumulated.is_empty() {
                    transcript
                } else {
                    accumulated
                };

                info!("Assistant transcript: {}", text);
                if !text.is_empty() {
                    self.caption = text.clone();
                    self.turns.push_assistant(text);
                }
            }
            ServerEvent::SpeechStarted => {
                info!("User speech detected");

                if self.speech == SpeechState::AgentResponding || self.playback.queued_samples() > 0 {
                    self.barge_in();
                } else {
                    self.speech = SpeechState::UserSpeaking;
                }

                self.turns.push_user(SPEECH_PLACEHOLDER);
            }
            ServerEvent::SpeechStopped => {
                info!("User speech ended");
                self.settle();
                self.send(ClientCommand::CommitInput);
                self.send(ClientCommand::create_response(None));
            }
            ServerEvent::ResponseDone => {
                debug!("Response completed");
                self.settle();
            }
            ServerEvent::Error { error } => match error.classify() {
                RemoteErrorKind::CancelNotActive => {
                    info!("No active response to cancel; continuing");
                }
                RemoteErrorKind::Transient => {
                    warn!("Ignoring remote error {:?}: {}", error.code, error.message);
                }
                RemoteErrorKind::Fatal => {
                    error!(
                        "Remote error ({}, {:?}): {}; disabling speech mode",
                        error.kind, error.code, error.message
                    );
                    self.disable_speech();
                    return Flow::Disconnect;
                }
            },
            ServerEvent::Unknown => {}
        }

        Flow::Continue
    }

    fn on_audio_delta(&mut self, item_id: String, delta: &str) {
        if self.is_cancelled(&item_id) {
            return;
        }

        // Decode before touching the queue
        let frame = match AudioFrame::from_base64(delta, self.playback.sample_rate()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable audio delta for {}: {}", item_id, e);
                return;
            }
        };

        if self.playback_item.as_deref() != Some(item_id.as_str()) {
            if self.playback_item.is_some() {
                debug!("New audio item {}; discarding queued audio", item_id);
            }
            self.playback.reset();
            self.item_frames = 0;
            self.playback_item = Some(item_id.clone());
        }

        self.begin_response(&item_id);
        self.playback.enqueue(frame);
        self.item_frames += 1;
    }

    fn begin_response(&mut self, item_id: &str) {
        if self.active_item.as_deref() != Some(item_id) {
            self.active_item = Some(item_id.to_string());
        }
        self.speech = SpeechState::AgentResponding;
    }

    fn is_cancelled(&self, item_id: &str) -> bool {
        self.cancelled_item.as_deref() == Some(item_id)
    }

    /// Back to Idle without touching queued audio
    fn settle(&mut self) {
        self.speech = SpeechState::Idle;
        self.active_item = None;
    }

    /// Optimistic local reset with a best-effort remote cancel
    fn barge_in(&mut self) {
        let in_flight = self.speech == SpeechState::AgentResponding;
        self.speech = SpeechState::Cancelling;

        if in_flight {
            info!("Interrupting agent response");
            self.cancelled_item = self.active_item.take();
            self.send(ClientCommand::CancelResponse);
        }

        self.playback.stop();
        self.playback.reset();
        self.item_frames = 0;
        self.playback_item = None;
        if !self.transcripts.is_empty() {
            debug!("Dropping partial transcripts");
            self.transcripts.clear();
        }
        self.caption.clear();
        self.settle();
    }

    /// Explicit stop from the user
    pub fn interrupt(&mut self) {
        self.barge_in();
    }

    /// Log a typed message and decide how to get a reply
    pub fn submit_text(&mut self, text: &str) -> TextRoute {
        let text = text.trim();
        if text.is_empty() {
            return TextRoute::Ignored;
        }

        if self.speech == SpeechState::AgentResponding || self.playback.queued_samples() > 0 {
            self.barge_in();
        }

        self.turns.push_user(text);

        if self.speech_mode && self.session_ready && self.connection.is_active() {
            let sent = self.connection.send(ClientCommand::user_message(text)).is_ok()
                && self.connection.send(ClientCommand::create_response(None)).is_ok();
            if sent {
                return TextRoute::Streamed;
            }
            warn!("Realtime send failed; using fallback reply");
        }

        TextRoute::Fallback(self.turns.turns().to_vec())
    }

    /// Record the single-shot reply, or the apology if it failed
    pub fn apply_fallback_reply(&mut self, reply: anyhow::Result<String>) {
        let text = match reply {
            Ok(text) => text,
            Err(e) => {
                warn!("Fallback reply failed: {:#}", e);
                APOLOGY.to_string()
            }
        };

        info!("Assistant says: {}", text);
        self.caption = text.clone();
        self.turns.push_assistant(text);
    }

    /// Returns true when a new connection should be started
    pub fn enable_speech(&mut self) -> bool {
        if self.speech_mode {
            return false;
        }
        info!("Speech mode enabled");
        self.speech_mode = true;
        true
    }

    /// Interrupt, silence playback and drop the session
    pub fn disable_speech(&mut self) {
        if self.speech_mode {
            info!("Speech mode disabled");
        }
        self.speech_mode = false;
        self.barge_in();
        self.session_ready = false;
        self.pending_greeting = None;
        self.connection.close();
    }

    pub fn on_connect_failed(&mut self, failure: &ConnectFailure) {
        warn!("{}; continuing in text-only mode", failure);
        self.disable_speech();
    }

    pub fn on_stream_closed(&mut self) {
        self.session_ready = false;
        if self.speech_mode {
            warn!("Realtime session ended; disabling speech mode");
            self.disable_speech();
        }
    }

    pub fn on_capture_failed(&mut self, failure: &DeviceError) {
        error!("Microphone failed: {}; disabling speech mode", failure);
        self.disable_speech();
    }

    fn send(&self, command: ClientCommand) {
        let kind = command.kind();
        if let Err(e) = self.connection.send(command) {
            debug!("Dropped {}: {}", kind, e);
        }
    }
}

fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
