// Microphone input via cpal
//
// The cpal callback converts whatever the device delivers into mono i16 at the
// session rate and pushes it into a lock-free SPSC ring. The capture worker
// drains the ring in 20 ms frames. When the worker falls behind, the samples
// that do not fit are dropped and the next read reports an overflow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{error, info};

use super::frame::AudioFrame;
use crate::error::DeviceError;

/// Result of polling an input device for one frame
#[derive(Debug)]
pub enum DeviceRead {
    /// A full frame; `overflowed` is set if samples were lost before it
    Frame { frame: AudioFrame, overflowed: bool },
    /// Not enough samples buffered yet
    Pending,
    /// The source has no more audio (file inputs)
    Exhausted,
}

/// A polled source of fixed-size capture frames
///
/// Implementations are opened and dropped on the capture thread, so they do
/// not need to be `Send`. Dropping the device releases it.
pub trait InputDevice {
    fn read_frame(&mut self, frame_len: usize) -> Result<DeviceRead, DeviceError>;

    /// Device name for logging
    fn name(&self) -> &str;
}

/// Callback side of the microphone ring
struct RingWriter {
    producer: HeapProd<i16>,
    overflowed: Arc<AtomicBool>,
    scratch: Vec<i16>,
}

impl RingWriter {
    /// Downmix interleaved samples to mono and push them; never blocks
    fn push<T: Copy>(&mut self, data: &[T], channels: usize, convert: impl Fn(T) -> i16) {
        self.scratch.clear();
        self.scratch.extend(data.chunks(channels).map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(convert(s))).sum();
            (sum / frame.len() as i32) as i16
        }));

        let pushed = self.producer.push_slice(&self.scratch);
        if pushed < self.scratch.len() {
            self.overflowed.store(true, Ordering::Release);
        }
    }
}

/// Worker side of the microphone ring
struct RingReader {
    consumer: HeapCons<i16>,
    overflowed: Arc<AtomicBool>,
    sample_rate: u32,
}

impl RingReader {
    fn read_frame(&mut self, frame_len: usize) -> DeviceRead {
        if self.consumer.occupied_len() < frame_len {
            return DeviceRead::Pending;
        }

        let mut samples = vec![0i16; frame_len];
        self.consumer.pop_slice(&mut samples);
        let overflowed = self.overflowed.swap(false, Ordering::AcqRel);

        DeviceRead::Frame {
            frame: AudioFrame::new(samples, self.sample_rate),
            overflowed,
        }
    }
}

/// Ring holding at most `capacity` mono samples
fn ring(capacity: usize, sample_rate: u32) -> (RingWriter, RingReader) {
    let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
    let overflowed = Arc::new(AtomicBool::new(false));

    (
        RingWriter {
            producer,
            overflowed: Arc::clone(&overflowed),
            scratch: Vec::new(),
        },
        RingReader {
            consumer,
            overflowed,
            sample_rate,
        },
    )
}

/// Default microphone via cpal
pub struct CpalInput {
    name: String,
    reader: RingReader,
    failed: Arc<AtomicBool>,
    _stream: Stream,
}

impl CpalInput {
    /// Open the default input device at `sample_rate`, buffering at most
    /// `buffer_ms` of audio
    pub fn open(sample_rate: u32, buffer_ms: u64) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoDevice("input"))?;
        let name = device.name().unwrap_or_else(|_| "default input".to_string());

        let range = device
            .supported_input_configs()?
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
                    && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
            })
            .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::I16))
            .ok_or_else(|| {
                DeviceError::Config(format!("no i16/f32 input config at {sample_rate}Hz"))
            })?;

        let format = range.sample_format();
        let config: StreamConfig = range.with_sample_rate(SampleRate(sample_rate)).config();
        let channels = config.channels as usize;
        let capacity = (sample_rate as u64 * buffer_ms / 1000) as usize;

        let (writer, reader) = ring(capacity, sample_rate);
        let failed = Arc::new(AtomicBool::new(false));

        let stream = build_stream(&device, &config, format, channels, writer, Arc::clone(&failed))?;
        stream.play()?;

        info!(
            "Microphone {} opened ({}Hz, {} channels, {:?})",
            name, sample_rate, channels, format
        );

        Ok(Self {
            name,
            reader,
            failed,
            _stream: stream,
        })
    }
}

impl InputDevice for CpalInput {
    fn read_frame(&mut self, frame_len: usize) -> Result<DeviceRead, DeviceError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(DeviceError::Stream(format!("{} stopped delivering audio", self.name)));
        }

        Ok(self.reader.read_frame(frame_len))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    channels: usize,
    mut writer: RingWriter,
    failed: Arc<AtomicBool>,
) -> Result<Stream, DeviceError> {
    let on_error = move |err: cpal::StreamError| {
        error!("Audio capture error: {}", err);
        failed.store(true, Ordering::SeqCst);
    };

    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| writer.push(data, channels, |s| s),
            on_error,
            None,
        )?,
        _ => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                writer.push(data, channels, |s| {
                    (s * 32767.0).clamp(-32768.0, 32767.0) as i16
                })
            },
            on_error,
            None,
        )?,
    };

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::SAMPLE_RATE;

    fn samples(read: DeviceRead) -> (Vec<i16>, bool) {
        match read {
            DeviceRead::Frame { frame, overflowed } => (frame.samples().to_vec(), overflowed),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_stereo_block_is_downmixed() {
        let (mut writer, mut reader) = ring(16, SAMPLE_RATE);

        writer.push(&[10i16, 20, -4, 4, 7, 7, 100, 0], 2, |s| s);

        let (mono, overflowed) = samples(reader.read_frame(4));
        assert_eq!(mono, vec![15, 0, 7, 50]);
        assert!(!overflowed);
    }

    #[test]
    fn test_partial_frame_is_pending() {
        let (mut writer, mut reader) = ring(16, SAMPLE_RATE);

        writer.push(&[1i16, 2, 3], 1, |s| s);
        assert!(matches!(reader.read_frame(4), DeviceRead::Pending));

        writer.push(&[4i16], 1, |s| s);
        assert_eq!(samples(reader.read_frame(4)).0, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_full_ring_reports_overflow_once() {
        let (mut writer, mut reader) = ring(4, SAMPLE_RATE);

        writer.push(&[1i16, 2, 3, 4, 5, 6], 1, |s| s);

        let (kept, overflowed) = samples(reader.read_frame(4));
        assert_eq!(kept, vec![1, 2, 3, 4]);
        assert!(overflowed);

        writer.push(&[7i16, 8, 9, 10], 1, |s| s);
        let (next, overflowed) = samples(reader.read_frame(4));
        assert_eq!(next, vec![7, 8, 9, 10]);
        assert!(!overflowed);
    }

    #[test]
    fn test_f32_samples_are_scaled_and_clamped() {
        let (mut writer, mut reader) = ring(8, SAMPLE_RATE);

        writer.push(&[0.5f32, -2.0], 1, |s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16);

        assert_eq!(samples(reader.read_frame(2)).0, vec![16383, -32768]);
    }
}
