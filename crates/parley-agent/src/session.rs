//! Voice sessions.
//!
//! Each session runs an inbound task (VAD and one transcriber job per speech
//! segment), a control task (final transcripts, queued utterances, commands)
//! and one task per assistant turn, in which the response generator and the
//! speech synthesizer run joined. The inbound task never waits on a turn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::audio::{AudioFrame, SegmentId, SpeechSegment};
use parley_core::chat::{ChatContext, ChatRole};
use parley_core::config::{Config, VoiceConfig};
use parley_core::error::{ParleyError, Result};
use parley_core::types::{Transcript, TurnState};
use parley_media::bus::{InboundAudio, OutboundAudio, SessionAudio};
use parley_media::stt::{SttBackend, Transcriber, WhisperStt};
use parley_media::tts::{ElevenLabsTts, SpeakTarget, SpeechSynthesizer, TtsBackend};
use parley_media::vad::{EnergyVad, PreRollBuffer, VadEvent, VoiceActivityDetector};

use crate::SharedChat;
use crate::events::SessionEvent;
use crate::generator::{Delta, ReplyTurn, ResponseGenerator, record_interruption};
use crate::turn::{SpeechStartOutcome, TranscriptOutcome, TurnController, TurnTicket};

const EVENT_CAPACITY: usize = 256;

/// Factory for voice sessions sharing one set of backends.
#[derive(Clone)]
pub struct VoiceAssistant {
    voice: VoiceConfig,
    system_prompt: Option<String>,
    stt: Arc<dyn SttBackend>,
    synthesizer: SpeechSynthesizer,
    generator: Arc<ResponseGenerator>,
}

impl VoiceAssistant {
    pub fn new(
        voice: VoiceConfig,
        stt: Arc<dyn SttBackend>,
        tts: Arc<dyn TtsBackend>,
        generator: Arc<ResponseGenerator>,
    ) -> Self {
        let synthesizer = SpeechSynthesizer::new(tts, &voice);
        Self {
            voice,
            system_prompt: None,
            stt,
            synthesizer,
            generator,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Whisper STT, ElevenLabs TTS and the configured LLM provider.
    pub fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let stt = WhisperStt::from_config(&config.transcription.clone().unwrap_or_default())?;
        let tts = ElevenLabsTts::from_config(&config.tts.clone().unwrap_or_default())?;
        let generator = ResponseGenerator::from_config(Arc::clone(&config))?;
        let mut assistant = Self::new(config.voice(), Arc::new(stt), Arc::new(tts), Arc::new(generator));
        if let Some(prompt) = config.system_prompt() {
            assistant = assistant.with_system_prompt(prompt);
        }
        Ok(assistant)
    }

    pub fn voice(&self) -> &VoiceConfig {
        &self.voice
    }

    /// Start a session on the session side of an [`AudioFrameBus`](parley_media::bus::AudioFrameBus).
    pub fn start(&self, audio: SessionAudio) -> Result<VoiceSession> {
        let vad = EnergyVad::new(self.voice.vad.clone());
        self.start_with_vad(audio, Box::new(vad))
    }

    pub fn start_with_vad(&self, audio: SessionAudio, vad: Box<dyn VoiceActivityDetector>) -> Result<VoiceSession> {
        if audio.format != self.voice.format {
            return Err(ParleyError::Config(format!(
                "transport format {}Hz/{}ch differs from voice.format {}Hz/{}ch",
                audio.format.sample_rate,
                audio.format.channels,
                self.voice.format.sample_rate,
                self.voice.format.channels
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let chat: SharedChat = Arc::new(Mutex::new(ChatContext::new(self.system_prompt.as_deref())));
        let turns = TurnController::new(
            &self.voice,
            Arc::clone(&chat),
            audio.outbound.clone(),
            events.clone(),
            cancel.clone(),
        );
        let shared = Arc::new(SessionShared {
            id,
            voice: self.voice.clone(),
            synthesizer: self.synthesizer.clone(),
            generator: Arc::clone(&self.generator),
            turns,
            chat,
            outbound: audio.outbound,
            events,
            cancel,
            closed: AtomicBool::new(false),
        });
        info!(session = %shared.id, rate = audio.format.sample_rate, channels = audio.format.channels, "Voice session started");

        let transcriber = Transcriber::new(Arc::clone(&self.stt), audio.format, &self.voice.timeouts);
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let inbound = tokio::spawn(run_inbound(
            Arc::clone(&shared),
            audio.inbound,
            vad,
            transcriber,
            transcript_tx,
        ));
        let control = tokio::spawn(run_control(Arc::clone(&shared), transcript_rx, command_rx));

        Ok(VoiceSession {
            shared,
            commands: command_tx,
            tasks: vec![inbound, control],
        })
    }
}

/// Handle to a running voice session. Dropping it ends the session.
pub struct VoiceSession {
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<Command>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Queue an assistant utterance. It starts once nobody holds the floor
    /// and is recorded in the chat like a greeting.
    pub fn say(&self, text: impl Into<String>, allow_interruptions: bool) -> Result<()> {
        self.send(Command::Say {
            text: text.into(),
            allow_interruptions,
        })
    }

    /// Drop queued utterances, cancel the current turn and return to idle.
    pub fn reset(&self) -> Result<()> {
        self.send(Command::Reset)
    }

    /// End the session and wait for its tasks.
    pub async fn stop(self) {
        self.shared.close("stopped");
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> TurnState {
        self.shared.turns.state()
    }

    /// Snapshot of the conversation so far.
    pub fn chat(&self) -> ChatContext {
        self.shared.chat.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the session has ended for any reason.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(ParleyError::Transport("voice session is closed".into()));
        }
        self.commands
            .send(command)
            .map_err(|_| ParleyError::Transport("voice session is closed".into()))
    }
}

#[derive(Debug)]
enum Command {
    Say { text: String, allow_interruptions: bool },
    Reset,
}

#[derive(Debug)]
struct Utterance {
    text: String,
    interruptible: bool,
    record: bool,
}

struct SessionShared {
    id: String,
    voice: VoiceConfig,
    synthesizer: SpeechSynthesizer,
    generator: Arc<ResponseGenerator>,
    turns: TurnController,
    chat: SharedChat,
    outbound: OutboundAudio,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Publish an error. Fatal errors close the session; returns whether it did.
    fn report(&self, error: &ParleyError) -> bool {
        warn!(session = %self.id, kind = error.kind(), %error, "Session error");
        self.emit(SessionEvent::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        if error.is_fatal() {
            self.close(error.kind());
            return true;
        }
        false
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.id, reason, "Voice session closed");
        self.turns.shutdown();
        self.cancel.cancel();
        self.emit(SessionEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

/// Speech the VAD has opened and not yet ended.
struct OpenSegment {
    id: SegmentId,
    /// Feeds the segment's transcriber. `None` when the controller ignored
    /// the segment; it stays ignored until it ends.
    frames: Option<mpsc::UnboundedSender<AudioFrame>>,
    frame_count: usize,
}

impl OpenSegment {
    fn push(&mut self, frame: AudioFrame) {
        self.frame_count += 1;
        if let Some(frames) = &self.frames {
            let _ = frames.send(frame);
        }
    }
}

async fn run_inbound(
    shared: Arc<SessionShared>,
    mut inbound: InboundAudio,
    mut vad: Box<dyn VoiceActivityDetector>,
    transcriber: Transcriber,
    transcripts: mpsc::UnboundedSender<Transcript>,
) {
    // Start events are stamped where the hold began, so keep that much more.
    let span = Duration::from_millis(u64::from(shared.voice.pre_roll_ms) + shared.voice.vad.min_speech_ms);
    let mut pre_roll = PreRollBuffer::new(span);
    let mut next_segment = 0;
    let mut open: Option<OpenSegment> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = inbound.recv() => frame,
        };
        let Some(frame) = frame else {
            shared.report(&ParleyError::Transport("inbound audio closed".into()));
            break;
        };

        match vad.process(&frame) {
            Some(VadEvent::SpeechStart { at }) => {
                next_segment += 1;
                let id = SegmentId(next_segment);
                let outcome = shared.turns.on_speech_start(id, Instant::now());
                debug!(session = %shared.id, segment = %id, ?outcome, "Speech started");

                let frames = (outcome != SpeechStartOutcome::Ignored).then(|| {
                    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                    let transcriber = transcriber.clone();
                    let out = transcripts.clone();
                    let cancel = shared.cancel.child_token();
                    let speech = SpeechSegment::new(id, at);
                    tokio::spawn(async move { transcriber.run_segment(speech, frames_rx, out, cancel).await });
                    frames_tx
                });
                let mut segment = OpenSegment {
                    id,
                    frames,
                    frame_count: 0,
                };
                for earlier in pre_roll.drain() {
                    segment.push(earlier);
                }
                segment.push(frame);
                open = Some(segment);
            }
            Some(VadEvent::SpeechEnd { at }) => {
                if let Some(mut segment) = open.take() {
                    segment.push(frame);
                    debug!(
                        session = %shared.id,
                        segment = %segment.id,
                        frames = segment.frame_count,
                        ignored = segment.frames.is_none(),
                        end = ?at,
                        "Speech ended"
                    );
                }
            }
            None => match open.as_mut() {
                Some(segment) => segment.push(frame),
                None => pre_roll.push(frame),
            },
        }
    }
}

async fn run_control(
    shared: Arc<SessionShared>,
    mut transcripts: mpsc::UnboundedReceiver<Transcript>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut queued: VecDeque<Utterance> = VecDeque::new();
    let mut greeting = shared
        .voice
        .greeting
        .clone()
        .filter(|g| !g.trim().is_empty())
        .map(|text| (Instant::now() + Duration::from_millis(shared.voice.greeting_delay_ms), text));

    loop {
        if let Some(next) = queued.front() {
            if let Some(ticket) = shared.turns.begin_utterance(&next.text, next.interruptible, next.record) {
                if let Some(utterance) = queued.pop_front() {
                    tokio::spawn(run_utterance(Arc::clone(&shared), ticket, utterance.text));
                }
            }
        }

        let greeting_at = greeting.as_ref().map_or_else(Instant::now, |(at, _)| *at);
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(transcript) = transcripts.recv() => handle_transcript(&shared, transcript, &mut queued),
            command = commands.recv() => match command {
                Some(Command::Say { text, allow_interruptions }) => queued.push_back(Utterance {
                    text,
                    interruptible: allow_interruptions,
                    record: true,
                }),
                Some(Command::Reset) => {
                    queued.clear();
                    shared.turns.reset();
                }
                None => {
                    shared.close("session dropped");
                    break;
                }
            },
            _ = sleep_until(greeting_at), if greeting.is_some() => {
                if let Some((_, text)) = greeting.take() {
                    if conversation_started(&shared) {
                        debug!(session = %shared.id, "Conversation already started, skipping greeting");
                    } else {
                        queued.push_front(Utterance { text, interruptible: true, record: true });
                    }
                }
            }
            _ = shared.turns.idle(), if !queued.is_empty() => {}
        }
    }
}

fn conversation_started(shared: &SessionShared) -> bool {
    shared.turns.state() != TurnState::Idle
        || shared
            .chat
            .lock()
            .messages()
            .iter()
            .any(|m| m.role != ChatRole::System)
}

fn handle_transcript(shared: &Arc<SessionShared>, transcript: Transcript, queued: &mut VecDeque<Utterance>) {
    shared.emit(SessionEvent::Transcript {
        segment: transcript.segment,
        text: transcript.text.clone(),
        is_final: transcript.is_final,
    });
    if !transcript.is_final {
        return;
    }

    let segment = transcript.segment;
    match shared.turns.on_final_transcript(&transcript) {
        TranscriptOutcome::Committed(ticket) => {
            info!(session = %shared.id, %segment, turn = ticket.id, "User turn committed");
            tokio::spawn(run_reply(Arc::clone(shared), ticket));
        }
        TranscriptOutcome::Empty => debug!(session = %shared.id, %segment, "Empty transcript"),
        TranscriptOutcome::Failed => {
            shared.report(&ParleyError::Transcription(format!("no transcript for {segment}")));
            queued.push_front(Utterance {
                text: shared.voice.fallback_repeat.clone(),
                interruptible: true,
                record: false,
            });
        }
        TranscriptOutcome::Stale => debug!(session = %shared.id, %segment, "Discarded stale transcript"),
        TranscriptOutcome::Duplicate => debug!(session = %shared.id, %segment, "Duplicate final transcript"),
    }
}

/// Generate and speak the reply to a committed user turn.
async fn run_reply(shared: Arc<SessionShared>, ticket: TurnTicket) {
    let work = ticket.cancel.child_token();
    let (text_tx, text_rx) = mpsc::unbounded_channel::<String>();

    let turn = ReplyTurn {
        session_id: &shared.id,
        chat: &shared.chat,
        progress: &ticket.progress,
        cancel: &work,
    };
    let generator = &shared.generator;
    let emitter = &shared;
    let work_ref = &work;
    let generate = async move {
        let text_tx = text_tx;
        let result = generator
            .generate(turn, |delta| match delta {
                Delta::Text(text) => {
                    emitter.emit(SessionEvent::AssistantDelta { text: text.clone() });
                    let _ = text_tx.send(text);
                }
                Delta::ToolCall(call) => {
                    info!(session = %emitter.id, tool = %call.name, "Tool call");
                    emitter.emit(SessionEvent::ToolCalled {
                        name: call.name,
                        arguments: call.arguments,
                    });
                }
            })
            .await;
        drop(text_tx);
        if result.is_err() {
            work_ref.cancel();
        }
        result
    };

    let target = SpeakTarget {
        outbound: &shared.outbound,
        pass: ticket.pass,
        playout: &ticket.playout,
        cancel: &work,
    };
    let synthesizer = &shared.synthesizer;
    let turns = &shared.turns;
    let turn_id = ticket.id;
    let speak = async move {
        let result = synthesizer
            .speak(text_rx, target, || turns.on_playback_started(turn_id))
            .await;
        if result.is_err() {
            work_ref.cancel();
        }
        result
    };

    let (generated, spoken) = tokio::join!(generate, speak);
    if ticket.cancel.is_cancelled() {
        debug!(session = %shared.id, turn = ticket.id, "Turn cancelled");
        return;
    }

    match (generated, spoken) {
        (Err(error), _) | (Ok(_), Err(error)) => {
            if shared.report(&error) {
                return;
            }
            record_heard(&shared, &ticket);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(shared.voice.fallback_generation.clone());
            drop(tx);
            let fallback = ticket.cancel.child_token();
            let target = SpeakTarget {
                outbound: &shared.outbound,
                pass: ticket.pass,
                playout: &ticket.playout,
                cancel: &fallback,
            };
            let result = shared
                .synthesizer
                .speak(rx, target, || shared.turns.on_playback_started(ticket.id))
                .await;
            if let Err(e) = result {
                if shared.report(&e) {
                    return;
                }
            }
        }
        (Ok(outcome), Ok(speech)) => {
            debug!(session = %shared.id, turn = ticket.id, ?outcome, ?speech, "Reply complete");
        }
    }

    finish_turn(&shared, &ticket).await;
}

/// Speak a fixed utterance (greeting, `say`, fallback prompt).
async fn run_utterance(shared: Arc<SessionShared>, ticket: TurnTicket, text: String) {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(text);
    drop(tx);

    let target = SpeakTarget {
        outbound: &shared.outbound,
        pass: ticket.pass,
        playout: &ticket.playout,
        cancel: &ticket.cancel,
    };
    let result = shared
        .synthesizer
        .speak(rx, target, || shared.turns.on_playback_started(ticket.id))
        .await;
    if ticket.cancel.is_cancelled() {
        return;
    }
    if let Err(e) = result {
        if shared.report(&e) {
            return;
        }
        record_heard(&shared, &ticket);
    }
    finish_turn(&shared, &ticket).await;
}

/// Keep only what the user hears of a turn that failed part way. Audio
/// already handed to the transport still plays out.
fn record_heard(shared: &SessionShared, ticket: &TurnTicket) {
    let heard_by = ticket.playout.drained_at().unwrap_or_else(Instant::now);
    let spoken = ticket.playout.spoken_chars(heard_by);
    let mut chat = shared.chat.lock();
    let mut progress = ticket.progress.lock();
    record_interruption(&mut chat, &mut progress, spoken);
}

/// Wait for the turn's audio to play out, then hand the floor back.
async fn finish_turn(shared: &SessionShared, ticket: &TurnTicket) {
    shared.turns.on_audio_complete(ticket.id);
    if let Some(drained) = ticket.playout.drained_at() {
        tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return,
            _ = sleep_until(drained) => {}
        }
    }
    if shared.turns.on_turn_finished(ticket.id) {
        debug!(session = %shared.id, turn = ticket.id, "Turn finished");
    }
}
