//! Speech-to-text: the backend trait, a Whisper-compatible HTTP backend and
//! the per-segment [`Transcriber`] with its retry policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::audio::{AudioFormat, AudioFrame, SpeechSegment};
use parley_core::config::{TimeoutConfig, TranscriptionConfig};
use parley_core::types::Transcript;

/// Update from a streaming STT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Interim(String),
    Final(String),
}

/// A speech-to-text service.
///
/// `transcribe` reads `frames` until the channel closes (the segment was
/// sealed), sends zero or more `Interim` events and then one `Final`. An
/// `Err` means the backend stream failed. Dropping the returned future must
/// abort any request in flight.
#[async_trait]
pub trait SttBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn transcribe(
        &self,
        format: AudioFormat,
        frames: mpsc::UnboundedReceiver<AudioFrame>,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> Result<()>;
}

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    const BITS_PER_SAMPLE: u16 = 16;
    let data_len = pcm.len() * 2;
    let byte_rate = sample_rate * channels as u32 * BITS_PER_SAMPLE as u32 / 8;
    let block_align = channels * BITS_PER_SAMPLE / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }

    wav
}

/// Transcription endpoint for the configured provider.
pub fn provider_url(config: &TranscriptionConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => "https://api.openai.com/v1/audio/transcriptions".to_string(),
        _ => "https://api.groq.com/openai/v1/audio/transcriptions".to_string(),
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "whisper-1",
        _ => "whisper-large-v3-turbo",
    }
}

/// Whisper-style HTTP transcription (Groq, OpenAI, or any compatible server).
///
/// The segment is buffered and uploaded once it is sealed, so only a final
/// transcript is produced.
pub struct WhisperStt {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
}

impl WhisperStt {
    pub fn from_config(config: &TranscriptionConfig) -> Result<Self> {
        let api_key = config.resolve_api_key();
        if api_key.is_none() && config.base_url.is_none() {
            anyhow::bail!("No transcription API key configured");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: provider_url(config),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model(&config.provider).to_string()),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl SttBackend for WhisperStt {
    fn id(&self) -> &str {
        "whisper"
    }

    async fn transcribe(
        &self,
        format: AudioFormat,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> Result<()> {
        let mut pcm = Vec::new();
        while let Some(frame) = frames.recv().await {
            pcm.extend_from_slice(frame.samples());
        }
        if pcm.is_empty() {
            let _ = events.send(SttEvent::Final(String::new()));
            return Ok(());
        }

        let wav = pcm_to_wav(&pcm, format.sample_rate, format.channels);
        debug!(url = %self.url, model = %self.model, wav_bytes = wav.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut req = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        let _ = events.send(SttEvent::Final(text.trim().to_string()));
        Ok(())
    }
}

/// Drives one STT session per speech segment and turns backend trouble into
/// at most one retry followed by a failed final transcript.
#[derive(Clone)]
pub struct Transcriber {
    backend: Arc<dyn SttBackend>,
    format: AudioFormat,
    final_timeout: Duration,
    retry_backoff: Duration,
}

impl Transcriber {
    pub fn new(backend: Arc<dyn SttBackend>, format: AudioFormat, timeouts: &TimeoutConfig) -> Self {
        Self {
            backend,
            format,
            final_timeout: Duration::from_millis(timeouts.stt_final_timeout_ms),
            retry_backoff: Duration::from_millis(timeouts.stt_retry_backoff_ms),
        }
    }

    /// Transcribe `speech`, whose frames arrive on `frames`; the sender is
    /// dropped when VAD ends the segment, which seals it. The segment keeps
    /// every frame so a retry can replay it. Every update goes to `out`,
    /// ending with exactly one final transcript unless `cancel` fires first.
    pub async fn run_segment(
        &self,
        mut speech: SpeechSegment,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        out: mpsc::UnboundedSender<Transcript>,
        cancel: CancellationToken,
    ) {
        let segment = speech.id;
        let mut input_open = !speech.is_sealed();

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(self.retry_backoff) => {}
                }
                debug!(%segment, audio = ?speech.audio_duration(), "Retrying transcription");
            }

            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            for frame in speech.frames() {
                let _ = frame_tx.send(frame.clone());
            }
            let mut frame_tx = input_open.then_some(frame_tx);
            let mut deadline = (!input_open).then(|| Instant::now() + self.final_timeout);

            let mut session = self.backend.transcribe(self.format, frame_rx, event_tx);
            let mut session_done = false;
            let mut events_closed = false;

            let outcome: std::result::Result<String, String> = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    frame = frames.recv(), if input_open => match frame {
                        Some(frame) => {
                            if let Some(tx) = &frame_tx {
                                let _ = tx.send(frame.clone());
                            }
                            if let Err(e) = speech.push(frame) {
                                debug!(%segment, error = %e, "Dropped frame");
                            }
                        }
                        None => {
                            let end = speech
                                .frames()
                                .last()
                                .map_or(speech.start, |f| f.captured_at() + f.duration());
                            speech.seal(end);
                            input_open = false;
                            frame_tx = None;
                            deadline = Some(Instant::now() + self.final_timeout);
                        }
                    },
                    event = event_rx.recv(), if !events_closed => match event {
                        Some(SttEvent::Interim(text)) => {
                            let _ = out.send(Transcript::interim(segment, text));
                        }
                        Some(SttEvent::Final(text)) => break Ok(text),
                        None => {
                            events_closed = true;
                            if session_done {
                                break Err("stream ended without a final transcript".into());
                            }
                        }
                    },
                    result = &mut session, if !session_done => {
                        session_done = true;
                        match result {
                            Err(e) => break Err(e.to_string()),
                            Ok(()) if events_closed => {
                                break Err("stream ended without a final transcript".into());
                            }
                            Ok(()) => {}
                        }
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        break Err(format!("no final transcript within {:?}", self.final_timeout));
                    }
                }
            };

            match outcome {
                Ok(text) => {
                    let _ = out.send(Transcript::final_text(segment, text));
                    return;
                }
                Err(reason) => {
                    warn!(%segment, backend = self.backend.id(), attempt = attempt + 1, %reason, "Transcription failed");
                }
            }
        }

        let _ = out.send(Transcript::failed(segment));
    }
}
