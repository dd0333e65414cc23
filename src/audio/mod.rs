pub mod capture;
pub mod file;
pub mod frame;
pub mod input;
pub mod output;
pub mod playback;

pub use capture::{CaptureHandle, CaptureSettings, CaptureTarget};
pub use file::WavInput;
pub use frame::{samples_per_frame, AudioFrame, FRAME_MS, SAMPLE_RATE};
pub use input::{CpalInput, DeviceRead, InputDevice};
pub use output::{CpalOutput, OutputDevice};
pub use playback::{PlaybackBuffer, PlaybackSource};
