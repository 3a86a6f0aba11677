//! Audio frames and speech segments.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// PCM format negotiated once per session. Samples are always signed 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Number of interleaved samples in a frame of `frame_ms` milliseconds.
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        (self.sample_rate as usize * frame_ms as usize / 1000) * self.channels as usize
    }

    /// Playback duration of `samples` interleaved samples.
    pub fn duration_of(&self, samples: usize) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = samples as u64 / self.channels as u64;
        Duration::from_micros(per_channel * 1_000_000 / self.sample_rate as u64)
    }
}

/// An immutable block of PCM samples with its capture timestamp.
///
/// `captured_at` is the offset from the start of the stream the frame belongs
/// to. Samples live behind an `Arc` so retaining a frame for replay does not
/// copy audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    format: AudioFormat,
    captured_at: Duration,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[i16]>>, format: AudioFormat, captured_at: Duration) -> Self {
        Self {
            samples: samples.into(),
            format,
            captured_at,
        }
    }

    /// Decode little-endian 16-bit PCM.
    pub fn from_le_bytes(bytes: &[u8], format: AudioFormat, captured_at: Duration) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ParleyError::Protocol("empty audio frame".into()));
        }
        if bytes.len() % 2 != 0 {
            return Err(ParleyError::Protocol(format!(
                "audio frame has odd byte length {}",
                bytes.len()
            )));
        }
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        if format.channels == 0 || samples.len() % format.channels as usize != 0 {
            return Err(ParleyError::Protocol(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                format.channels
            )));
        }
        Ok(Self::new(samples, format, captured_at))
    }

    /// Encode as little-endian 16-bit PCM.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn captured_at(&self) -> Duration {
        self.captured_at
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }

    /// Root-mean-square energy of the frame.
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.samples.len() as f64).sqrt()
    }
}

/// Identifier of a VAD segment, unique and increasing within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg-{}", self.0)
    }
}

/// Contiguous span of speech frames bounded by VAD start/end events.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub id: SegmentId,
    pub start: Duration,
    pub end: Option<Duration>,
    frames: Vec<AudioFrame>,
}

impl SpeechSegment {
    pub fn new(id: SegmentId, start: Duration) -> Self {
        Self {
            id,
            start,
            end: None,
            frames: Vec::new(),
        }
    }

    /// Append a frame. Frames pushed after sealing are rejected.
    pub fn push(&mut self, frame: AudioFrame) -> Result<()> {
        if self.is_sealed() {
            return Err(ParleyError::Protocol(format!(
                "frame appended to sealed segment {}",
                self.id
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn seal(&mut self, end: Duration) {
        if self.end.is_none() {
            self.end = Some(end);
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.end.is_some()
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn audio_duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }
}
