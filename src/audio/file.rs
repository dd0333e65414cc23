use std::path::Path;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader};
use tracing::info;

use super::frame::AudioFrame;
use super::input::{DeviceRead, InputDevice};
use crate::error::DeviceError;

/// WAV file played back as if it were a microphone
///
/// Used for offline runs and tests. The file must already be 16-bit mono
/// PCM at the session rate; frames are released in real time unless pacing
/// is disabled.
pub struct WavInput {
    path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    samples: Vec<i16>,
    position: usize,
    paced: bool,
    started: Option<Instant>,
}

impl WavInput {
    pub fn open(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)?;

        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != SampleFormat::Int
            || spec.sample_rate != sample_rate
        {
            return Err(DeviceError::Config(format!(
                "{} must be 16-bit mono PCM at {}Hz (got {} channels, {} bits, {}Hz)",
                path.display(),
                sample_rate,
                spec.channels,
                spec.bits_per_sample,
                spec.sample_rate
            )));
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()?;

        let duration_seconds = samples.len() as f64 / spec.sample_rate as f64;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} samples",
            duration_seconds,
            spec.sample_rate,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            samples,
            position: 0,
            paced: true,
            started: None,
        })
    }

    /// Release frames as fast as they are polled
    pub fn without_pacing(mut self) -> Self {
        self.paced = false;
        self
    }

    fn frame_due(&mut self) -> bool {
        if !self.paced {
            return true;
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        let due = Duration::from_secs_f64(self.position as f64 / self.sample_rate as f64);
        started.elapsed() >= due
    }
}

impl InputDevice for WavInput {
    fn read_frame(&mut self, frame_len: usize) -> Result<DeviceRead, DeviceError> {
        // A trailing partial frame is discarded
        if self.samples.len() - self.position < frame_len {
            return Ok(DeviceRead::Exhausted);
        }

        if !self.frame_due() {
            return Ok(DeviceRead::Pending);
        }

        let end = self.position + frame_len;
        let frame = AudioFrame::new(self.samples[self.position..end].to_vec(), self.sample_rate);
        self.position = end;

        Ok(DeviceRead::Frame {
            frame,
            overflowed: false,
        })
    }

    fn name(&self) -> &str {
        &self.path
    }
}
