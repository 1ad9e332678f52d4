//! PCM16 audio buffers and their base64 wire packing.

use base64::Engine;

/// Sample rate the Live API expects for microphone input.
pub const LIVE_INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the audio the Live API speaks back.
pub const LIVE_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// An immutable, mono buffer of 16-bit signed PCM samples.
///
/// Chunks are produced once (by the capture engine or the frame decoder) and
/// then moved to their consumer; there is no way to mutate the samples after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioChunk {
    /// Wraps mono samples recorded at `sample_rate`.
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decodes a base64 string of little-endian PCM16 bytes.
    ///
    /// A trailing odd byte is ignored.
    pub fn from_base64(data: &str, sample_rate: u32) -> Result<Self, base64::DecodeError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self::mono(samples, sample_rate))
    }

    /// Packs the samples as base64 little-endian PCM16.
    pub fn to_base64(&self) -> String {
        let bytes: Vec<u8> = self
            .samples
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always 1: every chunk in this system is mono.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// MIME type advertised for this chunk on the wire.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Clips a float sample to [-1, 1] and scales it to the i16 range.
///
/// Negative values scale by 32768 and non-negative values by 32767 so that
/// both rails map exactly onto `i16::MIN` and `i16::MAX`.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let clipped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if clipped < 0.0 {
        (clipped * 32768.0) as i16
    } else {
        (clipped * 32767.0) as i16
    }
}

/// Converts a slice of float samples to PCM16 with [`f32_to_pcm16`].
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32.iter().copied().map(f32_to_pcm16).collect()
}

/// Converts PCM16 samples to normalized floats.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Reads the `rate=` parameter of an `audio/pcm` MIME type.
pub fn rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}
