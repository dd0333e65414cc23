// Realtime session lifecycle
//
// `ConnectionManager` is the only owner of `ConnectionState`. A session is
// usable once `connect` returns: outbound commands go through an unbounded
// channel to a writer task, inbound frames come back as an `EventStream`.
// Each session gets a number so that a stale stream ending cannot tear down
// its successor.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::FusedStream;
use futures::{SinkExt, Stream};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{ClientCommand, ServerEvent, SessionSettings};
use super::transport::{Connector, Duplex, FrameSink, FrameStream};
use crate::error::{ConnectFailure, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Failed,
}

/// State shared with live event streams
struct Shared {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    session: AtomicU64,
}

impl Shared {
    /// Drop the live session if it is still `session`
    fn release(&self, session: u64) {
        if self.session.load(Ordering::SeqCst) != session {
            return;
        }

        let sender = lock(&self.outbound).take();
        // Dropping the sender lets the writer flush and close the socket
        drop(sender);
        drop(lock(&self.writer).take());

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    max_attempts: u32,
    retry_delay: Duration,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, max_attempts: u32, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            connector,
            max_attempts: max_attempts.max(1),
            retry_delay,
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(None),
                writer: Mutex::new(None),
                session: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Open and configure a session, retrying with a fixed delay
    ///
    /// Any live session is closed first. On success the returned stream
    /// yields inbound events until the remote side goes away.
    pub async fn connect(&self, settings: &SessionSettings) -> Result<EventStream, ConnectFailure> {
        self.close();
        self.shared.state.send_replace(ConnectionState::Connecting);

        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            info!(
                "Connecting to {} (attempt {}/{})",
                self.connector.name(),
                attempt,
                self.max_attempts
            );

            match self.open_configured(settings).await {
                Ok(Duplex { sink, stream }) => {
                    let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
                    let (tx, rx) = mpsc::unbounded_channel();
                    let writer = tokio::spawn(write_commands(sink, rx));

                    *lock(&self.shared.outbound) = Some(tx);
                    *lock(&self.shared.writer) = Some(writer);
                    self.shared.state.send_replace(ConnectionState::Active);

                    info!("Realtime session {} active", session);

                    return Ok(EventStream {
                        inner: stream,
                        shared: Arc::clone(&self.shared),
                        session,
                        done: false,
                    });
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {:#}", attempt, e);
                    last_error = format!("{:#}", e);

                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.shared.state.send_replace(ConnectionState::Failed);

        Err(ConnectFailure::MaxAttempts {
            attempts: self.max_attempts,
            last_error,
        })
    }

    async fn open_configured(&self, settings: &SessionSettings) -> Result<Duplex> {
        let mut duplex = self.connector.open().await?;

        let update = ClientCommand::SessionUpdate {
            session: settings.clone(),
        }
        .encode()
        .context("Failed to encode session.update")?;

        duplex
            .sink
            .send(update)
            .await
            .context("Failed to send session configuration")?;

        Ok(duplex)
    }

    /// Queue a command for the writer task
    ///
    /// Never blocks; callable from the capture thread.
    pub fn send(&self, command: ClientCommand) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::NotConnected);
        }

        let outbound = lock(&self.shared.outbound);
        let sender = outbound.as_ref().ok_or(SendError::NotConnected)?;

        if !matches!(command, ClientCommand::AppendAudio { .. }) {
            debug!("Sending {}", command.kind());
        }

        sender.send(command).map_err(|_| SendError::Closed)
    }

    /// Release the live session, if any
    pub fn close(&self) {
        let session = self.shared.session.load(Ordering::SeqCst);
        if self.state() != ConnectionState::Disconnected {
            info!("Closing realtime session {}", session);
        }
        self.shared.release(session);
    }
}

async fn write_commands(mut sink: FrameSink, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
    while let Some(command) = commands.recv().await {
        let text = match command.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", command.kind(), e);
                continue;
            }
        };

        if let Err(e) = sink.send(text).await {
            warn!("Realtime writer stopped: {:#}", e);
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Error closing realtime sink: {:#}", e);
    }
}

/// Inbound events of one session
///
/// Malformed frames are skipped. The stream ends, and the connection drops to
/// `Disconnected`, when the transport ends or errors.
pub struct EventStream {
    inner: FrameStream,
    shared: Arc<Shared>,
    session: u64,
    done: bool,
}

impl EventStream {
    fn finish(&mut self) -> Poll<Option<ServerEvent>> {
        self.done = true;
        self.shared.release(self.session);
        Poll::Ready(None)
    }
}

impl Stream for EventStream {
    type Item = ServerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<ServerEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => return Poll::Ready(Some(event)),
                    Err(e) => warn!("Skipping malformed event: {} ({})", e, text),
                },
                Poll::Ready(Some(Err(e))) => {
                    warn!("Realtime stream error: {:#}", e);
                    return this.finish();
                }
                Poll::Ready(None) => {
                    info!("Realtime stream ended");
                    return this.finish();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl FusedStream for EventStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}
