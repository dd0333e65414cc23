// Dialogue service
//
// Owns one live conversation at a time. A driver task runs the state machine
// over three inputs: commands from the presentation layer, internal
// notifications (connect results, fallback replies, microphone failures) and
// the realtime event stream. After every step it publishes a `DialogueView`
// snapshot; nothing else writes conversation state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fallback::{ChatBackend, ChatCompletions, ChatCompletionsConfig};
use super::machine::{ConversationStateMachine, Flow, TextRoute};
use super::state::{DialogueView, EndSummary, Position};
use crate::audio::{
    AudioFrame, CaptureHandle, CaptureSettings, CaptureTarget, CpalInput, CpalOutput, InputDevice,
    OutputDevice, PlaybackBuffer, PlaybackSource, WavInput,
};
use crate::config::Config;
use crate::error::{ConnectFailure, DeviceError, DialogueError};
use crate::persona::Persona;
use crate::realtime::{
    ClientCommand, ConnectionManager, Connector, EventStream, ServerEvent, SessionSettings,
    TurnDetection, WebSocketConnector,
};

/// Opens the microphone on the capture thread
pub type InputOpener = Arc<dyn Fn() -> Result<Box<dyn InputDevice>, DeviceError> + Send + Sync>;

/// Opens the speaker for a playback queue
pub type OutputOpener =
    Arc<dyn Fn(PlaybackSource) -> Result<Box<dyn OutputDevice>, DeviceError> + Send + Sync>;

/// External collaborators of a dialogue
#[derive(Clone)]
pub struct DialogueDeps {
    pub connector: Arc<dyn Connector>,
    pub chat: Arc<dyn ChatBackend>,
    pub input: InputOpener,
    pub output: OutputOpener,
}

#[derive(Debug, Clone)]
pub struct DialogueSettings {
    pub sample_rate: u32,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub turn_detection: TurnDetection,
    pub strict_overflow: bool,
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            sample_rate: crate::audio::SAMPLE_RATE,
            max_attempts: 3,
            retry_delay: Duration::from_millis(2000),
            turn_detection: TurnDetection::default(),
            strict_overflow: true,
        }
    }
}

enum Command {
    SubmitText(String),
    ToggleSpeech(oneshot::Sender<bool>),
    Interrupt,
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    Connected {
        generation: u64,
        result: Result<EventStream, ConnectFailure>,
    },
    FallbackReply(anyhow::Result<String>),
    CaptureFailed {
        generation: u64,
        error: DeviceError,
    },
}

struct LiveConversation {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    origin: Position,
}

pub struct Dialogue {
    deps: DialogueDeps,
    settings: DialogueSettings,
    view: Arc<watch::Sender<DialogueView>>,
    live: Mutex<Option<LiveConversation>>,
}

impl Dialogue {
    pub fn new(deps: DialogueDeps, settings: DialogueSettings) -> Self {
        let (view, _) = watch::channel(DialogueView::default());

        Self {
            deps,
            settings,
            view: Arc::new(view),
            live: Mutex::new(None),
        }
    }

    /// Production wiring: realtime WebSocket, chat completions, cpal devices
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let api_key = cfg.api_key().context("No API key configured")?;

        let connector = Arc::new(WebSocketConnector::new(cfg.realtime.endpoint(), api_key.clone()));

        let chat = Arc::new(ChatCompletions::new(ChatCompletionsConfig {
            url: cfg.fallback.url.clone(),
            api_key,
            model: cfg.fallback.model.clone(),
            temperature: cfg.fallback.temperature,
            max_tokens: cfg.fallback.max_tokens,
        }));

        let sample_rate = cfg.audio.sample_rate;
        let buffer_ms = cfg.audio.input_buffer_ms;

        let input: InputOpener = match cfg.audio.input_file.clone() {
            Some(path) => {
                info!("Microphone input replaced by {}", path);
                Arc::new(move || -> Result<Box<dyn InputDevice>, DeviceError> {
                    let input = WavInput::open(&path, sample_rate)?;
                    Ok(Box::new(input))
                })
            }
            None => Arc::new(move || -> Result<Box<dyn InputDevice>, DeviceError> {
                let input = CpalInput::open(sample_rate, buffer_ms)?;
                Ok(Box::new(input))
            }),
        };

        let output: OutputOpener = Arc::new(
            move |source: PlaybackSource| -> Result<Box<dyn OutputDevice>, DeviceError> {
                let output = CpalOutput::open(source, sample_rate)?;
                Ok(Box::new(output))
            },
        );

        let settings = DialogueSettings {
            sample_rate,
            max_attempts: cfg.connection.max_attempts,
            retry_delay: Duration::from_millis(cfg.connection.retry_delay_ms),
            turn_detection: cfg.realtime.turn_detection.clone(),
            strict_overflow: cfg.audio.strict_overflow,
        };

        Ok(Self::new(
            DialogueDeps {
                connector,
                chat,
                input,
                output,
            },
            settings,
        ))
    }

    /// Start a conversation, ending any live one first
    ///
    /// Speech mode starts enabled; if the realtime session cannot be opened
    /// the conversation carries on in text-only mode.
    pub async fn start(&self, persona: Persona, origin: Option<Position>) {
        let mut live = self.live.lock().await;
        if let Some(previous) = live.take() {
            info!("Ending previous conversation");
            shutdown(previous).await;
        }

        let origin = origin.unwrap_or_default();
        info!("Dialogue started with {} ({})", persona.name, persona.role);

        let mut playback = PlaybackBuffer::new(self.settings.sample_rate);
        match (self.deps.output)(playback.source()) {
            Ok(device) => playback.set_output(device),
            Err(e) => warn!("Speaker unavailable, playback disabled: {}", e),
        }

        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&self.deps.connector),
            self.settings.max_attempts,
            self.settings.retry_delay,
        ));

        let machine = ConversationStateMachine::new(Arc::clone(&connection), playback, &persona);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            machine,
            connection,
            session: persona.session_settings(&self.settings.turn_detection),
            capture_settings: CaptureSettings::new(
                self.settings.sample_rate,
                self.settings.strict_overflow,
            ),
            deps: self.deps.clone(),
            view: Arc::clone(&self.view),
            internal,
            events: None,
            capture: None,
            connecting: None,
            generation: 0,
        };

        // Visible as active before the first command can arrive
        driver.enable_speech();
        self.view.send_replace(driver.machine.view(true));

        let task = tokio::spawn(driver.run(command_rx, internal_rx));

        *live = Some(LiveConversation {
            commands,
            task,
            origin,
        });
    }

    /// Type a message to the agent
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<(), DialogueError> {
        self.command(Command::SubmitText(text.into())).await
    }

    /// Flip speech mode; returns the new setting
    pub async fn toggle_speech_mode(&self) -> Result<bool, DialogueError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ToggleSpeech(tx)).await?;
        rx.await.map_err(|_| DialogueError::NotActive)
    }

    /// Stop the agent mid-response
    pub async fn interrupt(&self) -> Result<(), DialogueError> {
        self.command(Command::Interrupt).await
    }

    /// End the conversation and release devices and the session
    pub async fn end(&self) -> Option<EndSummary> {
        let live = self.live.lock().await.take()?;
        let return_position = live.origin;

        shutdown(live).await;
        info!("Dialogue ended");

        Some(EndSummary { return_position })
    }

    async fn command(&self, command: Command) -> Result<(), DialogueError> {
        let live = self.live.lock().await;
        let live = live.as_ref().ok_or(DialogueError::NotActive)?;
        live.commands.send(command).map_err(|_| DialogueError::NotActive)
    }

    pub fn view(&self) -> DialogueView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DialogueView> {
        self.view.subscribe()
    }

    pub fn current_caption(&self) -> String {
        self.view.borrow().caption.clone()
    }

    pub fn active(&self) -> bool {
        self.view.borrow().active
    }

    pub fn speech_mode(&self) -> bool {
        self.view.borrow().speech_mode
    }
}

async fn shutdown(live: LiveConversation) {
    let (done, finished) = oneshot::channel();
    if live.commands.send(Command::Shutdown(done)).is_ok() {
        let _ = finished.await;
    }
    if let Err(e) = live.task.await {
        error!("Dialogue task failed: {}", e);
    }
}

/// Forwards microphone frames while the session can take them
struct SpeechUplink {
    connection: Arc<ConnectionManager>,
    view: watch::Receiver<DialogueView>,
    internal: mpsc::UnboundedSender<Internal>,
    generation: u64,
}

impl CaptureTarget for SpeechUplink {
    fn accepting(&self) -> bool {
        let view = self.view.borrow();
        view.speech_mode && view.session_ready && self.connection.is_active()
    }

    fn forward(&self, frame: AudioFrame) {
        if let Err(e) = self.connection.send(ClientCommand::append_audio(&frame)) {
            debug!("Dropped microphone frame: {}", e);
        }
    }

    fn device_failed(&self, error: DeviceError) {
        let _ = self.internal.send(Internal::CaptureFailed {
            generation: self.generation,
            error,
        });
    }
}

struct Driver {
    machine: ConversationStateMachine,
    connection: Arc<ConnectionManager>,
    session: SessionSettings,
    capture_settings: CaptureSettings,
    deps: DialogueDeps,
    view: Arc<watch::Sender<DialogueView>>,
    internal: mpsc::UnboundedSender<Internal>,
    events: Option<EventStream>,
    capture: Option<CaptureHandle>,
    connecting: Option<JoinHandle<()>>,
    /// Bumped whenever speech resources are released; stale notes are dropped
    generation: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(note) = internal.recv() => self.handle_internal(note),
                event = next_event(&mut self.events) => match event {
                    Some(event) => {
                        if self.machine.handle_event(event) == Flow::Disconnect {
                            self.events = None;
                        }
                    }
                    None => {
                        self.events = None;
                        self.machine.on_stream_closed();
                    }
                },
            }

            if !self.machine.speech_mode() {
                self.release_speech();
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SubmitText(text) => {
                if let TextRoute::Fallback(turns) = self.machine.submit_text(&text) {
                    let chat = Arc::clone(&self.deps.chat);
                    let internal = self.internal.clone();
                    tokio::spawn(async move {
                        let reply = chat.complete(&turns).await;
                        let _ = internal.send(Internal::FallbackReply(reply));
                    });
                }
            }
            Command::ToggleSpeech(reply) => {
                if self.machine.speech_mode() {
                    self.machine.disable_speech();
                } else {
                    self.enable_speech();
                }
                let _ = reply.send(self.machine.speech_mode());
            }
            Command::Interrupt => self.machine.interrupt(),
            Command::Shutdown(_) => {}
        }
    }

    fn handle_internal(&mut self, note: Internal) {
        match note {
            Internal::Connected { generation, result } => {
                if generation != self.generation {
                    debug!("Discarding stale connection result");
                    if result.is_ok() && !self.machine.speech_mode() && self.connecting.is_none() {
                        self.connection.close();
                    }
                    return;
                }

                self.connecting = None;
                match result {
                    Ok(events) => self.events = Some(events),
                    Err(failure) => self.machine.on_connect_failed(&failure),
                }
            }
            Internal::FallbackReply(reply) => self.machine.apply_fallback_reply(reply),
            Internal::CaptureFailed { generation, error } => {
                if generation == self.generation {
                    self.machine.on_capture_failed(&error);
                }
            }
        }
    }

    /// Start a connection attempt and the capture thread
    fn enable_speech(&mut self) {
        if !self.machine.enable_speech() {
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        let connection = Arc::clone(&self.connection);
        let session = self.session.clone();
        let internal = self.internal.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = connection.connect(&session).await;
            let _ = internal.send(Internal::Connected { generation, result });
        }));

        let opener = Arc::clone(&self.deps.input);
        let uplink = SpeechUplink {
            connection: Arc::clone(&self.connection),
            view: self.view.subscribe(),
            internal: self.internal.clone(),
            generation,
        };

        match CaptureHandle::spawn(self.capture_settings.clone(), move || opener(), uplink) {
            Ok(handle) => self.capture = Some(handle),
            Err(e) => {
                let failure = DeviceError::Stream(format!("failed to spawn capture thread: {e}"));
                self.machine.on_capture_failed(&failure);
            }
        }
    }

    /// Drop everything speech mode holds; safe to call repeatedly
    fn release_speech(&mut self) {
        if self.events.is_none() && self.capture.is_none() && self.connecting.is_none() {
            return;
        }

        self.generation += 1;
        self.events = None;

        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
            self.connection.close();
        }

        if let Some(capture) = self.capture.take() {
            capture.signal();
            tokio::task::spawn_blocking(move || capture.stop());
        }
    }

    async fn shutdown(&mut self) {
        self.machine.disable_speech();

        self.generation += 1;
        self.events = None;
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        self.connection.close();

        if let Some(capture) = self.capture.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || capture.stop()).await {
                error!("Capture shutdown failed: {}", e);
            }
        }

        self.view.send_modify(|view| {
            view.active = false;
            view.speech_mode = false;
            view.session_ready = false;
            view.caption.clear();
        });
    }

    fn publish(&self) {
        self.view.send_if_modified(|view| self.machine.refresh(view));
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<ServerEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceRead, SAMPLE_RATE};
    use crate::realtime::{ConnectionState, Duplex};
    use async_trait::async_trait;
    use futures::channel::mpsc as chan;
    use futures::SinkExt;
    use std::time::Instant;

    /// Session whose writes land in a channel and which never hangs up
    struct Loopback {
        written: chan::UnboundedSender<String>,
    }

    #[async_trait]
    impl Connector for Loopback {
        async fn open(&self) -> Result<Duplex> {
            Ok(Duplex {
                sink: Box::pin(self.written.clone().sink_map_err(anyhow::Error::from)),
                stream: futures::stream::pending::<Result<String>>().boxed(),
            })
        }

        fn name(&self) -> &str {
            "loopback"
        }
    }

    /// Microphone delivering one frame every 20 ms
    struct Metronome {
        last: Option<Instant>,
    }

    impl InputDevice for Metronome {
        fn read_frame(&mut self, frame_len: usize) -> Result<DeviceRead, DeviceError> {
            if self
                .last
                .is_some_and(|last| last.elapsed() < Duration::from_millis(20))
            {
                return Ok(DeviceRead::Pending);
            }
            self.last = Some(Instant::now());

            Ok(DeviceRead::Frame {
                frame: AudioFrame::new(vec![1; frame_len], SAMPLE_RATE),
                overflowed: false,
            })
        }

        fn name(&self) -> &str {
            "metronome"
        }
    }

    fn appends(written: &mut chan::UnboundedReceiver<String>) -> usize {
        let mut count = 0;
        while let Ok(Some(text)) = written.try_next() {
            if text.contains("\"input_audio_buffer.append\"") {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_uplink_silent_while_speech_mode_off_on_active_session() -> Result<()> {
        let (tx, mut written) = chan::unbounded();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(Loopback { written: tx }),
            1,
            Duration::from_millis(1),
        ));
        let _events = connection
            .connect(&Persona::hr().session_settings(&TurnDetection::default()))
            .await?;
        assert_eq!(connection.state(), ConnectionState::Active);

        let (view, _) = watch::channel(DialogueView {
            active: true,
            speech_mode: false,
            session_ready: true,
            ..DialogueView::default()
        });
        let (internal, _internal_rx) = mpsc::unbounded_channel();

        let uplink = SpeechUplink {
            connection: Arc::clone(&connection),
            view: view.subscribe(),
            internal,
            generation: 1,
        };
        let settings = CaptureSettings {
            idle_interval: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            ..CaptureSettings::new(SAMPLE_RATE, true)
        };
        let capture = CaptureHandle::spawn(
            settings,
            || Ok(Box::new(Metronome { last: None }) as Box<dyn InputDevice>),
            uplink,
        )?;

        // Several frame periods with the session live but speech mode off
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connection.state(), ConnectionState::Active);
        assert_eq!(appends(&mut written), 0);

        view.send_modify(|v| v.speech_mode = true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(appends(&mut written) > 0);

        view.send_modify(|v| v.speech_mode = false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        appends(&mut written);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(appends(&mut written), 0);

        tokio::task::spawn_blocking(move || capture.stop()).await?;
        Ok(())
    }
}
