// Microphone capture worker
//
// Runs on its own OS thread (cpal streams are not `Send`). Polls the input
// device for 20 ms frames and forwards them to a `CaptureTarget` only while
// the target is accepting. The device is opened on the thread and dropped on
// every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::frame::{samples_per_frame, AudioFrame};
use super::input::{DeviceRead, InputDevice};
use crate::error::DeviceError;

/// Where captured frames go
pub trait CaptureTarget: Send + 'static {
    /// Whether frames should be forwarded right now
    fn accepting(&self) -> bool;

    fn forward(&self, frame: AudioFrame);

    /// The device failed; the worker is about to exit
    fn device_failed(&self, error: DeviceError);
}

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub sample_rate: u32,
    /// Drop frames that follow an overflow instead of forwarding them
    pub strict_overflow: bool,
    /// Sleep while the target is not accepting
    pub idle_interval: Duration,
    /// Sleep while the device has less than a frame buffered
    pub poll_interval: Duration,
}

impl CaptureSettings {
    pub fn new(sample_rate: u32, strict_overflow: bool) -> Self {
        Self {
            sample_rate,
            strict_overflow,
            idle_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Handle to a running capture thread
pub struct CaptureHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Spawn the capture thread; `open` runs on that thread
    pub fn spawn<O, T>(settings: CaptureSettings, open: O, target: T) -> std::io::Result<Self>
    where
        O: FnOnce() -> Result<Box<dyn InputDevice>, DeviceError> + Send + 'static,
        T: CaptureTarget,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("colloquy-capture".to_string())
            .spawn(move || run(settings, open, target, flag))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Whether the capture loop is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the loop to exit and wait for the device to be released
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    /// Signal the loop to exit without waiting
    pub fn signal(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn shutdown_and_join(&mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run<O, T>(settings: CaptureSettings, open: O, target: T, shutdown: Arc<AtomicBool>)
where
    O: FnOnce() -> Result<Box<dyn InputDevice>, DeviceError>,
    T: CaptureTarget,
{
    let mut device = match open() {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to open capture device: {}", e);
            target.device_failed(e);
            return;
        }
    };

    let frame_len = samples_per_frame(settings.sample_rate);
    let mut forwarded: u64 = 0;

    info!("Capture started on {} ({} samples per frame)", device.name(), frame_len);

    while !shutdown.load(Ordering::SeqCst) {
        if !target.accepting() {
            thread::sleep(settings.idle_interval);
            continue;
        }

        match device.read_frame(frame_len) {
            Ok(DeviceRead::Frame { frame, overflowed }) => {
                if overflowed {
                    if settings.strict_overflow {
                        warn!("Capture buffer overflowed; dropping frame");
                        continue;
                    }
                    debug!("Capture buffer overflowed; forwarding frame anyway");
                }

                target.forward(frame);
                forwarded += 1;
            }
            Ok(DeviceRead::Pending) => thread::sleep(settings.poll_interval),
            Ok(DeviceRead::Exhausted) => {
                info!("Capture source {} exhausted", device.name());
                break;
            }
            Err(e) => {
                error!("Capture device {} failed: {}", device.name(), e);
                target.device_failed(e);
                break;
            }
        }
    }

    info!("Capture stopped ({} frames forwarded)", forwarded);
    drop(device);
}
