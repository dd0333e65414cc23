// Jitter buffer between the conversation task and the output callback
//
// The conversation task decodes inbound audio and enqueues whole frames; the
// hardware callback pulls fixed-size blocks. The FIFO lock is the only state
// shared between the two and is held only while the queue is mutated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::frame::AudioFrame;
use super::output::OutputDevice;

#[derive(Debug, Default)]
struct Fifo {
    frames: VecDeque<AudioFrame>,
    /// Samples of the front frame already handed to the device
    offset: usize,
    queued: usize,
    played: u64,
}

impl Fifo {
    fn push(&mut self, frame: AudioFrame) {
        self.queued += frame.len();
        self.frames.push_back(frame);
    }

    /// Copy queued samples into `out`, splitting the front frame if needed
    fn fill(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let Some(front) = self.frames.front() else {
                break;
            };

            let remaining = &front.samples()[self.offset..];
            let take = remaining.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&remaining[..take]);

            written += take;
            self.offset += take;

            if self.offset == front.len() {
                self.frames.pop_front();
                self.offset = 0;
            }
        }

        self.queued -= written;
        self.played += written as u64;
        written
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.offset = 0;
        self.queued = 0;
    }
}

/// Pull side of the playback buffer, handed to the output callback
#[derive(Clone)]
pub struct PlaybackSource {
    fifo: Arc<Mutex<Fifo>>,
}

impl PlaybackSource {
    /// Fill `out` with queued audio, padding with silence on underrun
    ///
    /// Returns how many samples came from the queue. Never blocks on
    /// anything but the FIFO lock.
    pub fn pull(&self, out: &mut [i16]) -> usize {
        let written = lock(&self.fifo).fill(out);
        out[written..].fill(0);
        written
    }
}

/// Thread-safe FIFO of decoded PCM frames feeding a real-time output
pub struct PlaybackBuffer {
    fifo: Arc<Mutex<Fifo>>,
    output: Option<Box<dyn OutputDevice>>,
    playing: AtomicBool,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// Create a buffer with no device attached (samples are only queued)
    pub fn new(sample_rate: u32) -> Self {
        Self {
            fifo: Arc::new(Mutex::new(Fifo::default())),
            output: None,
            playing: AtomicBool::new(false),
            sample_rate,
        }
    }

    /// Handle for the output callback
    pub fn source(&self) -> PlaybackSource {
        PlaybackSource {
            fifo: Arc::clone(&self.fifo),
        }
    }

    /// Attach the device that drains [`PlaybackBuffer::source`]
    pub fn set_output(&mut self, output: Box<dyn OutputDevice>) {
        self.output = Some(output);
    }

    /// Append a frame; the first frame after a stop starts the device
    pub fn enqueue(&self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }

        if frame.sample_rate() != self.sample_rate {
            warn!(
                "Playback frame sample rate mismatch: expected {}, got {}. Dropping frame.",
                self.sample_rate,
                frame.sample_rate()
            );
            return;
        }

        lock(&self.fifo).push(frame);

        if !self.playing.swap(true, Ordering::SeqCst) {
            if let Some(output) = &self.output {
                if let Err(e) = output.play() {
                    warn!("Failed to start playback device: {}", e);
                }
            }
        }
    }

    /// Drop queued audio and zero the played-sample counter
    pub fn reset(&self) {
        let mut fifo = lock(&self.fifo);
        fifo.clear();
        fifo.played = 0;
    }

    /// Halt the output device and drop queued audio
    pub fn stop(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            if let Some(output) = &self.output {
                if let Err(e) = output.pause() {
                    warn!("Failed to pause playback device: {}", e);
                }
            }
            debug!("Playback stopped");
        }

        lock(&self.fifo).clear();
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn queued_samples(&self) -> usize {
        lock(&self.fifo).queued
    }

    /// Samples handed to the device since the last reset
    pub fn played_samples(&self) -> u64 {
        lock(&self.fifo).played
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn lock(fifo: &Mutex<Fifo>) -> MutexGuard<'_, Fifo> {
    fifo.lock().unwrap_or_else(PoisonError::into_inner)
}
