//! Streaming TTS: the backend trait, ElevenLabs, and the
//! [`SpeechSynthesizer`] that turns a reply's text deltas into outbound
//! frames, chunk by chunk.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use parley_core::audio::{AudioFormat, AudioFrame};
use parley_core::config::{ChunkerConfig, TtsConfig, VoiceConfig};
use parley_core::error::ParleyError;

use crate::bus::{OutboundAudio, PassId};
use crate::chunker::SentenceChunker;
use crate::playout::Playout;

/// Interleaved 16-bit PCM in the requested format, in arbitrary pieces.
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Vec<i16>>> + Send>>;

/// A text-to-speech service. Dropping the stream must close the request.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn synthesize(&self, text: &str, format: AudioFormat) -> Result<PcmStream>;
}

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(base_url: &str, voice: &str, sample_rate: u32) -> String {
    format!(
        "{}/v1/text-to-speech/{voice}/stream?output_format=pcm_{sample_rate}",
        base_url.trim_end_matches('/')
    )
}

/// ElevenLabs streaming TTS returning raw mono PCM.
pub struct ElevenLabsTts {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsTts {
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            voice_id: config.voice_id.clone().unwrap_or_else(|| "Rachel".to_string()),
            model_id: config
                .model_id
                .clone()
                .unwrap_or_else(|| "eleven_turbo_v2_5".to_string()),
        })
    }
}

#[async_trait]
impl TtsBackend for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, format: AudioFormat) -> Result<PcmStream> {
        let url = build_tts_url(&self.base_url, &self.voice_id, format.sample_rate);
        debug!(voice = %self.voice_id, model = %self.model_id, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let channels = format.channels;
        let mut carry = None;
        let stream = resp.bytes_stream().map(move |chunk| -> Result<Vec<i16>> {
            let bytes = chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
            Ok(upmix(decode_pcm(&mut carry, &bytes), channels))
        });
        Ok(Box::pin(stream))
    }
}

/// Decode little-endian PCM that may be split at odd byte offsets.
fn decode_pcm(carry: &mut Option<u8>, bytes: &[u8]) -> Vec<i16> {
    let mut out = Vec::with_capacity(bytes.len() / 2 + 1);
    let mut rest = bytes;
    if let Some(low) = carry.take() {
        match rest.split_first() {
            Some((&high, tail)) => {
                out.push(i16::from_le_bytes([low, high]));
                rest = tail;
            }
            None => {
                *carry = Some(low);
                return out;
            }
        }
    }
    let mut pairs = rest.chunks_exact(2);
    out.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
    if let [odd] = pairs.remainder() {
        *carry = Some(*odd);
    }
    out
}

fn upmix(mono: Vec<i16>, channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return mono;
    }
    mono.into_iter()
        .flat_map(|s| std::iter::repeat_n(s, channels as usize))
        .collect()
}

/// Cuts PCM into frames of a fixed duration. The last frame of a chunk may
/// be shorter.
pub struct FrameAssembler {
    samples_per_frame: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat, frame_ms: u32) -> Self {
        Self {
            samples_per_frame: format.samples_per_frame(frame_ms).max(format.channels.max(1) as usize),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, pcm: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(pcm);
        let mut frames = Vec::new();
        while self.pending.len() >= self.samples_per_frame {
            let rest = self.pending.split_off(self.samples_per_frame);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    pub fn finish(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// How a synthesis pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// All text was synthesized and enqueued.
    Completed { audio: Duration },
    /// Cancelled or the pass was closed; undelivered audio was discarded.
    Cancelled,
}

/// Everything one pass writes to: the outbound bus under its pass id, the
/// playout ledger, and the cancellation token of the turn.
pub struct SpeakTarget<'a> {
    pub outbound: &'a OutboundAudio,
    pub pass: PassId,
    pub playout: &'a Playout,
    pub cancel: &'a CancellationToken,
}

struct PassState<F> {
    on_first_audio: Option<F>,
    captured: Duration,
    audio: Duration,
}

#[derive(Clone)]
pub struct SpeechSynthesizer {
    backend: Arc<dyn TtsBackend>,
    format: AudioFormat,
    frame_ms: u32,
    first_chunk_timeout: Duration,
    chunker: ChunkerConfig,
}

impl SpeechSynthesizer {
    pub fn new(backend: Arc<dyn TtsBackend>, voice: &VoiceConfig) -> Self {
        Self {
            backend,
            format: voice.format,
            frame_ms: voice.frame_ms,
            first_chunk_timeout: Duration::from_millis(voice.timeouts.tts_first_chunk_timeout_ms),
            chunker: voice.chunker.clone(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Speak the text arriving on `text` until the channel closes.
    ///
    /// Chunks are synthesized one at a time, so chunk N+1 is only enqueued
    /// after all of chunk N. `on_first_audio` runs once, right after the
    /// first frame of the pass was enqueued.
    pub async fn speak<F>(
        &self,
        mut text: mpsc::UnboundedReceiver<String>,
        target: SpeakTarget<'_>,
        on_first_audio: F,
    ) -> Result<SpeakOutcome, ParleyError>
    where
        F: FnOnce() + Send,
    {
        let mut chunker = SentenceChunker::new(&self.chunker);
        let mut state = PassState {
            on_first_audio: Some(on_first_audio),
            captured: Duration::ZERO,
            audio: Duration::ZERO,
        };

        loop {
            let delta = tokio::select! {
                biased;
                _ = target.cancel.cancelled() => return Ok(SpeakOutcome::Cancelled),
                delta = text.recv() => delta,
            };
            let (chunks, done) = match delta {
                Some(delta) => (chunker.push(&delta), false),
                None => (chunker.finish().into_iter().collect(), true),
            };
            for chunk in chunks {
                if !self.speak_chunk(&chunk, &target, &mut state).await? {
                    return Ok(SpeakOutcome::Cancelled);
                }
            }
            if done {
                return Ok(SpeakOutcome::Completed { audio: state.audio });
            }
        }
    }

    /// Returns false when the pass was cancelled.
    async fn speak_chunk<F>(
        &self,
        chunk: &str,
        target: &SpeakTarget<'_>,
        state: &mut PassState<F>,
    ) -> Result<bool, ParleyError>
    where
        F: FnOnce() + Send,
    {
        target.playout.begin_chunk(chunk);
        if chunk.trim().is_empty() {
            target.playout.end_chunk();
            return Ok(true);
        }

        let deadline = Instant::now() + self.first_chunk_timeout;
        let timed_out = || {
            ParleyError::Synthesis(format!(
                "no audio from {} within {:?}",
                self.backend.id(),
                self.first_chunk_timeout
            ))
        };

        let mut stream = tokio::select! {
            biased;
            _ = target.cancel.cancelled() => return Ok(false),
            opened = timeout_at(deadline, self.backend.synthesize(chunk, self.format)) => match opened {
                Err(_) => return Err(timed_out()),
                Ok(Err(e)) => return Err(ParleyError::Synthesis(e.to_string())),
                Ok(Ok(stream)) => stream,
            },
        };

        let mut assembler = FrameAssembler::new(self.format, self.frame_ms);
        let mut heard = false;
        loop {
            let next = if heard {
                tokio::select! {
                    biased;
                    _ = target.cancel.cancelled() => return Ok(false),
                    next = stream.next() => next,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = target.cancel.cancelled() => return Ok(false),
                    next = timeout_at(deadline, stream.next()) => next.map_err(|_| timed_out())?,
                }
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(ParleyError::Synthesis(e.to_string())),
                Some(Ok(pcm)) => {
                    heard |= !pcm.is_empty();
                    for samples in assembler.push(&pcm) {
                        if !self.deliver(samples, target, state)? {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        if let Some(samples) = assembler.finish() {
            if !self.deliver(samples, target, state)? {
                return Ok(false);
            }
        }
        target.playout.end_chunk();
        trace!(chunk_chars = chunk.chars().count(), "Chunk enqueued");
        Ok(true)
    }

    fn deliver<F>(&self, samples: Vec<i16>, target: &SpeakTarget<'_>, state: &mut PassState<F>) -> Result<bool, ParleyError>
    where
        F: FnOnce() + Send,
    {
        let frame = AudioFrame::new(samples, self.format, state.captured);
        let len = frame.duration();
        if !target.outbound.send(frame, target.pass)? {
            return Ok(false);
        }
        target.playout.push_audio(len, Instant::now());
        state.captured += len;
        state.audio += len;
        if let Some(first) = state.on_first_audio.take() {
            first();
        }
        Ok(true)
    }
}
