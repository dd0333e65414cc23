//! Speaker output driven by the hardware callback

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use tracing::{debug, error, info, warn};

use super::playback::PlaybackSource;
use crate::error::DeviceError;

/// An output device the playback buffer can start and halt
pub trait OutputDevice: Send + Sync {
    fn play(&self) -> Result<(), DeviceError>;

    fn pause(&self) -> Result<(), DeviceError>;
}

enum Control {
    Play,
    Pause,
    Shutdown,
}

/// Default output device via cpal
///
/// cpal streams are not `Send`, so the stream lives on its own thread and is
/// driven through a control channel. The stream callback pulls fixed-size
/// blocks from a [`PlaybackSource`].
pub struct CpalOutput {
    control: Sender<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    pub fn open(source: PlaybackSource, sample_rate: u32) -> Result<Self, DeviceError> {
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("colloquy-playback".to_string())
            .spawn(move || match build_stream(source, sample_rate) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    run_stream(stream, control_rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                control: control_tx,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Stream("playback thread exited during setup".to_string())),
        }
    }

    fn send(&self, control: Control) -> Result<(), DeviceError> {
        self.control
            .send(control)
            .map_err(|_| DeviceError::Stream("playback thread is gone".to_string()))
    }
}

impl OutputDevice for CpalOutput {
    fn play(&self) -> Result<(), DeviceError> {
        self.send(Control::Play)
    }

    fn pause(&self) -> Result<(), DeviceError> {
        self.send(Control::Pause)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                if handle.join().is_err() {
                    error!("Playback thread panicked");
                }
            }
        }
    }
}

fn run_stream(stream: Stream, control: Receiver<Control>) {
    // Exits on Shutdown or when the owning CpalOutput is dropped
    while let Ok(command) = control.recv() {
        let result = match command {
            Control::Play => stream.play().map_err(DeviceError::from),
            Control::Pause => stream.pause().map_err(DeviceError::from),
            Control::Shutdown => break,
        };

        if let Err(e) = result {
            warn!("Playback device control failed: {}", e);
        }
    }

    drop(stream);
    debug!("Playback stream released");
}

fn build_stream(source: PlaybackSource, sample_rate: u32) -> Result<Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoDevice("output"))?;

    let range = find_output_config(&device, sample_rate)?;
    let format = range.sample_format();
    let config: StreamConfig = range.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = config.channels as usize;

    info!(
        "Playback device {} ({}Hz, {} channels, {:?})",
        device.name().unwrap_or_default(),
        sample_rate,
        channels,
        format
    );

    let on_error = |err: cpal::StreamError| error!("Audio playback error: {}", err);

    let stream = match format {
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    write_block(&source, &mut scratch, data, channels, |s| s)
                },
                on_error,
                None,
            )?
        }
        SampleFormat::F32 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    write_block(&source, &mut scratch, data, channels, |s| {
                        f32::from(s) / 32768.0
                    })
                },
                on_error,
                None,
            )?
        }
        other => {
            return Err(DeviceError::Config(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    };

    // Start paused; the playback buffer resumes on the first frame
    stream.pause()?;

    Ok(stream)
}

/// Mono samples from the source, duplicated across output channels
fn write_block<T: Copy>(
    source: &PlaybackSource,
    scratch: &mut Vec<i16>,
    data: &mut [T],
    channels: usize,
    convert: impl Fn(i16) -> T,
) {
    let frames = data.len() / channels;
    if scratch.len() < frames {
        // Grows to the device block size once, then stays put
        scratch.resize(frames, 0);
    }

    let mono = &mut scratch[..frames];
    source.pull(mono);

    for (out, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
        out.fill(convert(sample));
    }
}

fn find_output_config(
    device: &Device,
    sample_rate: u32,
) -> Result<SupportedStreamConfigRange, DeviceError> {
    let supports = |c: &SupportedStreamConfigRange, channels: u16, format: SampleFormat| {
        c.channels() == channels
            && c.sample_format() == format
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let configs: Vec<SupportedStreamConfigRange> = device.supported_output_configs()?.collect();

    for channels in [1, 2] {
        for format in [SampleFormat::I16, SampleFormat::F32] {
            if let Some(found) = configs.iter().find(|c| supports(c, channels, format)) {
                return Ok(found.clone());
            }
        }
    }

    Err(DeviceError::Config(format!(
        "no mono/stereo i16/f32 output config at {sample_rate}Hz"
    )))
}
