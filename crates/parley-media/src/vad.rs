//! Energy-based Voice Activity Detection (VAD).

use std::collections::VecDeque;
use std::time::Duration;

use parley_core::audio::AudioFrame;
use parley_core::config::VadConfig;

/// Segment boundary reported by a detector. Timestamps are capture times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart { at: Duration },
    SpeechEnd { at: Duration },
}

/// Classifies inbound frames into speech and non-speech.
///
/// Implementations must alternate `SpeechStart` and `SpeechEnd`, starting
/// with `SpeechStart`: at most one segment is open at a time.
pub trait VoiceActivityDetector: Send {
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent>;

    fn is_speaking(&self) -> bool;

    fn reset(&mut self);
}

/// VAD over the RMS energy of 16-bit PCM.
///
/// Energy is mapped to a speech probability (`rms / reference_rms`, capped at
/// 1) and smoothed with an exponential moving average. Hold and silence
/// durations are measured on frame timestamps.
pub struct EnergyVad {
    config: VadConfig,
    probability: f32,
    speaking: bool,
    /// Start of the current run of frames above the enter threshold.
    candidate_since: Option<Duration>,
    /// Start of the current run of frames below the exit threshold.
    silence_since: Option<Duration>,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            probability: 0.0,
            speaking: false,
            candidate_since: None,
            silence_since: None,
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    fn raw_probability(&self, frame: &AudioFrame) -> f32 {
        if self.config.reference_rms <= 0.0 {
            return 0.0;
        }
        (frame.rms() as f32 / self.config.reference_rms).min(1.0)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let alpha = self.config.smoothing.clamp(f32::EPSILON, 1.0);
        self.probability = alpha * self.raw_probability(frame) + (1.0 - alpha) * self.probability;

        let frame_start = frame.captured_at();
        let frame_end = frame_start + frame.duration();

        if !self.speaking {
            if self.probability < self.config.enter_threshold {
                self.candidate_since = None;
                return None;
            }
            let since = *self.candidate_since.get_or_insert(frame_start);
            if frame_end.saturating_sub(since) >= Duration::from_millis(self.config.min_speech_ms) {
                self.speaking = true;
                self.candidate_since = None;
                self.silence_since = None;
                return Some(VadEvent::SpeechStart { at: since });
            }
            return None;
        }

        if self.probability >= self.config.exit_threshold {
            self.silence_since = None;
            return None;
        }
        let since = *self.silence_since.get_or_insert(frame_start);
        if frame_end.saturating_sub(since) >= Duration::from_millis(self.config.min_silence_ms) {
            self.speaking = false;
            self.silence_since = None;
            return Some(VadEvent::SpeechEnd { at: since });
        }
        None
    }

    fn is_speaking(&self) -> bool {
        self.speaking
    }

    fn reset(&mut self) {
        self.probability = 0.0;
        self.speaking = false;
        self.candidate_since = None;
        self.silence_since = None;
    }
}

/// Frames captured just before a `SpeechStart`, so the onset of speech is
/// handed to the transcriber with its segment.
pub struct PreRollBuffer {
    frames: VecDeque<AudioFrame>,
    span: Duration,
    buffered: Duration,
}

impl PreRollBuffer {
    pub fn new(span: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            span,
            buffered: Duration::ZERO,
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.buffered += frame.duration();
        self.frames.push_back(frame);
        while self.buffered > self.span {
            match self.frames.pop_front() {
                Some(old) => self.buffered = self.buffered.saturating_sub(old.duration()),
                None => break,
            }
        }
    }

    /// Take every buffered frame, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.buffered = Duration::ZERO;
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
