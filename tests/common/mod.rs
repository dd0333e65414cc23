// Shared fixtures for integration tests
//
// `MemoryConnector` stands in for the realtime endpoint: every opened session
// hands the test a `Remote` that can push server events and read the
// commands the client wrote.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use colloquy::audio::{
    AudioFrame, DeviceRead, InputDevice, OutputDevice, PlaybackSource, SAMPLE_RATE,
};
use colloquy::conversation::{ChatBackend, DialogueDeps, DialogueView, Turn};
use colloquy::realtime::{Connector, Duplex};
use colloquy::DeviceError;
use futures::channel::mpsc as chan;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(2);

/// Test side of one session
pub struct Remote {
    events: chan::UnboundedSender<Result<String>>,
    commands: chan::UnboundedReceiver<String>,
}

impl Remote {
    /// Deliver a server event to the client
    pub fn push(&self, event: Value) {
        let _ = self.events.unbounded_send(Ok(event.to_string()));
    }

    /// Deliver a raw frame, valid JSON or not
    pub fn push_raw(&self, text: &str) {
        let _ = self.events.unbounded_send(Ok(text.to_string()));
    }

    /// Fail the inbound stream
    pub fn fail(&self, message: &str) {
        let _ = self
            .events
            .unbounded_send(Err(anyhow::anyhow!(message.to_string())));
    }

    /// End the inbound stream as if the socket closed
    pub fn hang_up(&self) {
        self.events.close_channel();
    }

    /// Next command written by the client; `None` once the writer is gone
    pub async fn next_command(&mut self) -> Result<Option<Value>> {
        let text = tokio::time::timeout(WAIT, self.commands.next())
            .await
            .context("timed out waiting for a command")?;

        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Next command, which must exist
    pub async fn expect_command(&mut self) -> Result<Value> {
        self.next_command()
            .await?
            .context("writer closed before sending a command")
    }

    /// Everything written so far, without waiting
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Some(text)) = self.commands.try_next() {
            if let Ok(value) = serde_json::from_str(&text) {
                out.push(value);
            }
        }
        out
    }
}

pub fn command_types(commands: &[Value]) -> Vec<String> {
    commands
        .iter()
        .filter_map(|c| c["type"].as_str().map(str::to_string))
        .collect()
}

/// In-memory realtime endpoint
pub struct MemoryConnector {
    failures: AtomicU32,
    attempts: AtomicU32,
    sessions: mpsc::UnboundedSender<Remote>,
}

pub struct Sessions(mpsc::UnboundedReceiver<Remote>);

impl Sessions {
    pub async fn next(&mut self) -> Result<Remote> {
        tokio::time::timeout(WAIT, self.0.recv())
            .await
            .context("timed out waiting for a session")?
            .context("connector dropped")
    }
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, Sessions) {
        Self::failing(0)
    }

    /// Refuse the first `failures` attempts
    pub fn failing(failures: u32) -> (Arc<Self>, Sessions) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            sessions: tx,
        });
        (connector, Sessions(rx))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Duplex> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("connection refused");
        }

        let (command_tx, command_rx) = chan::unbounded::<String>();
        let (event_tx, event_rx) = chan::unbounded::<Result<String>>();

        let _ = self.sessions.send(Remote {
            events: event_tx,
            commands: command_rx,
        });

        Ok(Duplex {
            sink: Box::pin(command_tx.sink_map_err(anyhow::Error::from)),
            stream: event_rx.boxed(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Chat backend with a canned reply or failure
pub struct FakeChat {
    reply: Option<String>,
}

impl FakeChat {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { reply: None })
    }
}

#[async_trait]
impl ChatBackend for FakeChat {
    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        match &self.reply {
            Some(reply) if !turns.is_empty() => Ok(reply.clone()),
            _ => bail!("chat backend unavailable"),
        }
    }
}

/// Microphone producing a constant tone every 20 ms
pub struct ToneInput {
    value: i16,
    last: Option<Instant>,
}

impl ToneInput {
    pub fn new(value: i16) -> Self {
        Self { value, last: None }
    }
}

impl InputDevice for ToneInput {
    fn read_frame(&mut self, frame_len: usize) -> Result<DeviceRead, DeviceError> {
        if self
            .last
            .is_some_and(|last| last.elapsed() < Duration::from_millis(20))
        {
            return Ok(DeviceRead::Pending);
        }
        self.last = Some(Instant::now());

        Ok(DeviceRead::Frame {
            frame: AudioFrame::new(vec![self.value; frame_len], SAMPLE_RATE),
            overflowed: false,
        })
    }

    fn name(&self) -> &str {
        "tone"
    }
}

/// Dependencies with a tone microphone and no speaker
pub fn deps(connector: Arc<MemoryConnector>, chat: Arc<FakeChat>) -> DialogueDeps {
    DialogueDeps {
        connector,
        chat,
        input: Arc::new(|| -> Result<Box<dyn InputDevice>, DeviceError> {
            Ok(Box::new(ToneInput::new(100)))
        }),
        output: Arc::new(
            |_: PlaybackSource| -> Result<Box<dyn OutputDevice>, DeviceError> {
                Err(DeviceError::NoDevice("output"))
            },
        ),
    }
}

/// Wait until the published view satisfies `pred`
pub async fn wait_for(
    rx: &mut watch::Receiver<DialogueView>,
    pred: impl Fn(&DialogueView) -> bool,
) -> Result<DialogueView> {
    tokio::time::timeout(WAIT, async {
        loop {
            {
                let view = rx.borrow_and_update();
                if pred(&view) {
                    return Ok::<_, anyhow::Error>(view.clone());
                }
            }
            rx.changed().await?;
        }
    })
    .await
    .context("timed out waiting for dialogue view")?
}

/// Base64 PCM for `len` samples of `value`
pub fn pcm(value: i16, len: usize) -> String {
    AudioFrame::new(vec![value; len], SAMPLE_RATE).to_base64()
}
