//! Audio codec adapter: float samples ⇄ PCM16LE ⇄ base64.
//!
//! Capture produces mono 16 kHz frames, playback consumes mono 24 kHz
//! chunks. Neither direction resamples here; callers frame the audio at
//! the rate they declare.

use base64::Engine;

use super::error::AudioError;

/// Scale factor between normalized floats and signed 16-bit PCM.
const PCM16_SCALE: f32 = 32768.0;

/// Build the MIME type the Live API expects for raw PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Base64 (standard alphabet, padded) encoding of raw PCM16LE bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk(String);

impl EncodedChunk {
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// Encode raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode back to raw bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AudioError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.0)
            .map_err(|e| AudioError::MalformedAudioChunk {
                reason: format!("invalid base64: {e}"),
            })
    }
}

/// An encoded chunk tagged with its MIME type, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub data: EncodedChunk,
    pub mime_type: String,
}

impl AudioBlob {
    pub fn pcm(data: EncodedChunk, sample_rate: u32) -> Self {
        Self {
            data,
            mime_type: pcm_mime_type(sample_rate),
        }
    }
}

/// Interleaved signed 16-bit samples at a declared rate and channel count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if channels == 0 || samples.len() % channels as usize != 0 {
            return Err(AudioError::MisalignedFrame {
                len: samples.len(),
                channels,
            });
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Quantize normalized float samples. Out-of-range input is clamped
    /// rather than wrapped.
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        let pcm = samples.iter().copied().map(f32_to_i16).collect();
        Self::new(pcm, sample_rate, channels)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Pack as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    pub fn encode(&self) -> EncodedChunk {
        EncodedChunk::from_bytes(&self.to_le_bytes())
    }
}

/// Decoded, de-interleaved float audio ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Mono buffer from a single channel of samples.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Average of all channels at `frame`; zero past the end.
    pub fn mixed_sample(&self, frame: usize) -> f32 {
        if self.channels.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .map(|ch| ch.get(frame).copied().unwrap_or(0.0))
            .sum();
        sum / self.channels.len() as f32
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample * PCM16_SCALE)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Encode one mono capture frame for transmission.
pub fn encode_frame(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    EncodedChunk::from_bytes(&bytes)
}

/// Decode a server audio payload into per-channel float buffers.
pub fn decode_chunk(
    chunk: &EncodedChunk,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, AudioError> {
    if channels == 0 {
        return Err(AudioError::MalformedAudioChunk {
            reason: "channel count must be non-zero".into(),
        });
    }
    let bytes = chunk.to_bytes()?;
    let stride = usize::from(channels) * 2;
    if bytes.len() % stride != 0 {
        return Err(AudioError::MalformedAudioChunk {
            reason: format!(
                "{} bytes is not a multiple of {stride} ({channels} channel(s) of PCM16)",
                bytes.len()
            ),
        });
    }

    let frames = bytes.len() / stride;
    let mut out = vec![Vec::with_capacity(frames); usize::from(channels)];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % usize::from(channels)].push(f32::from(sample) / PCM16_SCALE);
    }
    Ok(AudioBuffer::new(sample_rate, out))
}
