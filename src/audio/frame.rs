use base64::Engine;

/// Session sample rate in Hz (16-bit mono PCM on the wire)
pub const SAMPLE_RATE: u32 = 24_000;

/// Length of one capture frame in milliseconds
pub const FRAME_MS: u32 = 20;

/// Number of samples in one 20 ms frame at `sample_rate`
pub const fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate * FRAME_MS / 1000) as usize
}

/// Audio sample data (16-bit PCM, mono)
///
/// Frames are immutable once built; ownership moves into whichever queue
/// consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Little-endian PCM16 bytes; a dangling odd byte is dropped
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Self::new(samples, sample_rate)
    }

    /// Decode a base64 PCM16 payload as carried by the realtime protocol
    pub fn from_base64(encoded: &str, sample_rate: u32) -> Result<Self, base64::DecodeError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(Self::from_pcm_bytes(&bytes, sample_rate))
    }

    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_pcm_bytes())
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_is_twenty_ms() {
        assert_eq!(samples_per_frame(24_000), 480);
        assert_eq!(samples_per_frame(16_000), 320);
    }

    #[test]
    fn test_pcm_bytes_are_little_endian() {
        let frame = AudioFrame::new(vec![1, -2, 0x1234], SAMPLE_RATE);
        assert_eq!(frame.to_pcm_bytes(), vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
    }

    #[test]
    fn test_odd_trailing_byte_is_dropped() {
        let frame = AudioFrame::from_pcm_bytes(&[0x10, 0x00, 0x7F], SAMPLE_RATE);
        assert_eq!(frame.samples(), &[16]);
    }

    #[test]
    fn test_base64_decode_rejects_garbage() {
        assert!(AudioFrame::from_base64("not base64!!", SAMPLE_RATE).is_err());
    }
}
