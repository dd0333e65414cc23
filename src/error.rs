//! Typed errors for the conversation pipeline
//!
//! Application code (config, transports, control surfaces) uses `anyhow`;
//! the pipeline seams return these so callers can match on the failure.

use thiserror::Error;

/// The realtime session could not be established
#[derive(Debug, Error)]
pub enum ConnectFailure {
    /// Every connection attempt failed; speech mode is unavailable
    #[error("gave up after {attempts} connection attempts: {last_error}")]
    MaxAttempts { attempts: u32, last_error: String },
}

/// An outbound command was rejected
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("realtime session is not connected")]
    NotConnected,

    #[error("realtime session writer has shut down")]
    Closed,
}

/// Audio device failure (capture or playback)
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {0} device available")]
    NoDevice(&'static str),

    #[error("unsupported device configuration: {0}")]
    Config(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("wav input error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<cpal::DevicesError> for DeviceError {
    fn from(err: cpal::DevicesError) -> Self {
        DeviceError::Config(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for DeviceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        DeviceError::Config(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::PauseStreamError> for DeviceError {
    fn from(err: cpal::PauseStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

/// How a remote `error` event should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// A cancel raced with the response finishing on the remote side
    CancelNotActive,
    /// Harmless protocol race; logged only
    Transient,
    /// Anything else: speech mode is torn down
    Fatal,
}

/// Control command sent to a conversation that is not running
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DialogueError {
    #[error("no conversation is active")]
    NotActive,
}
