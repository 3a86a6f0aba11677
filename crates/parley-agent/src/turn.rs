//! Turn arbitration between the user and the assistant.
//!
//! Every transition happens under one mutex, so VAD, transcript and playback
//! signals arriving concurrently are applied one at a time. Lock order is
//! turn state, then chat, then reply progress.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use parley_core::audio::SegmentId;
use parley_core::config::VoiceConfig;
use parley_core::types::{Transcript, TurnState};
use parley_media::bus::{OutboundAudio, PassId};
use parley_media::playout::Playout;

use crate::SharedChat;
use crate::events::SessionEvent;
use crate::generator::{ReplyProgress, record_interruption, record_utterance};

/// Handle for the work of one assistant turn.
pub struct TurnTicket {
    pub id: u64,
    pub pass: PassId,
    /// Cancelled when the turn is interrupted, reset or the session ends.
    pub cancel: CancellationToken,
    pub playout: Arc<Playout>,
    pub progress: Arc<Mutex<ReplyProgress>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechStartOutcome {
    /// The segment is now the user's open turn.
    Listening,
    /// The assistant was cut off; the segment is the user's open turn.
    Interrupted { spoken_chars: usize },
    /// Speech over the assistant that does not count (yet).
    Ignored,
}

pub enum TranscriptOutcome {
    Committed(TurnTicket),
    /// Blank final: back to idle, nothing recorded.
    Empty,
    /// Transcription gave up: back to idle, the user should be asked to repeat.
    Failed,
    /// Not the open segment.
    Stale,
    /// Segment at or before the last committed one.
    Duplicate,
}

struct ActiveTurn {
    id: u64,
    pass: PassId,
    cancel: CancellationToken,
    playout: Arc<Playout>,
    progress: Arc<Mutex<ReplyProgress>>,
    interruptible: bool,
    /// All audio of the turn has been enqueued.
    audio_complete: bool,
}

#[derive(Default)]
struct TurnInner {
    state: TurnState,
    open_segment: Option<SegmentId>,
    last_committed: Option<SegmentId>,
    active: Option<ActiveTurn>,
    next_turn: u64,
}

pub struct TurnController {
    inner: Mutex<TurnInner>,
    chat: SharedChat,
    outbound: OutboundAudio,
    events: broadcast::Sender<SessionEvent>,
    session: CancellationToken,
    grace: Duration,
    max_context_messages: usize,
    idle: Notify,
}

impl TurnController {
    pub fn new(
        voice: &VoiceConfig,
        chat: SharedChat,
        outbound: OutboundAudio,
        events: broadcast::Sender<SessionEvent>,
        session: CancellationToken,
    ) -> Self {
        Self {
            inner: Mutex::new(TurnInner::default()),
            chat,
            outbound,
            events,
            session,
            grace: Duration::from_millis(voice.turn.barge_in_grace_ms),
            max_context_messages: voice.max_context_messages,
            idle: Notify::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.inner.lock().state
    }

    /// Resolves after the controller next becomes idle (or immediately if an
    /// idle transition happened since the last wait).
    pub async fn idle(&self) {
        self.idle.notified().await;
    }

    pub fn active_turn(&self) -> Option<u64> {
        self.inner.lock().active.as_ref().map(|a| a.id)
    }

    /// VAD opened segment `segment`. Barge-in is decided here once per
    /// segment: an ignored segment stays ignored until it ends.
    pub fn on_speech_start(&self, segment: SegmentId, now: Instant) -> SpeechStartOutcome {
        let mut inner = self.inner.lock();
        if inner
            .active
            .as_ref()
            .is_some_and(|a| a.audio_complete && !a.playout.is_playing(now))
        {
            debug!(%segment, "Reply was heard in full");
            self.finish_active(&mut inner);
        }

        if inner.state.is_assistant() {
            if let Some(active) = &inner.active {
                if !active.interruptible {
                    return SpeechStartOutcome::Ignored;
                }
                // grace counts audio actually played, not gaps between chunks
                if inner.state == TurnState::AssistantSpeaking && active.playout.elapsed(now) <= self.grace {
                    trace!(%segment, "Speech inside barge-in grace period");
                    return SpeechStartOutcome::Ignored;
                }
            }
            let spoken_chars = self.cancel_active(&mut inner, now).unwrap_or(0);
            self.transition(&mut inner, TurnState::Interrupted);
            let _ = self.events.send(SessionEvent::Interrupted { spoken_chars });
            info!(%segment, spoken_chars, "Assistant interrupted");
            inner.open_segment = Some(segment);
            self.transition(&mut inner, TurnState::UserSpeaking);
            return SpeechStartOutcome::Interrupted { spoken_chars };
        }

        if let Some(previous) = inner.open_segment.replace(segment) {
            if previous != segment {
                debug!(%previous, %segment, "Newer segment supersedes open one");
            }
        }
        self.transition(&mut inner, TurnState::UserSpeaking);
        SpeechStartOutcome::Listening
    }

    /// A final transcript arrived.
    pub fn on_final_transcript(&self, transcript: &Transcript) -> TranscriptOutcome {
        let segment = transcript.segment;
        let mut inner = self.inner.lock();
        if inner.last_committed.is_some_and(|last| segment <= last) {
            return TranscriptOutcome::Duplicate;
        }
        if !transcript.is_final
            || inner.open_segment != Some(segment)
            || inner.state != TurnState::UserSpeaking
        {
            return TranscriptOutcome::Stale;
        }
        inner.open_segment = None;

        if transcript.failed {
            self.transition(&mut inner, TurnState::Idle);
            return TranscriptOutcome::Failed;
        }
        if transcript.is_blank() {
            self.transition(&mut inner, TurnState::Idle);
            return TranscriptOutcome::Empty;
        }

        inner.last_committed = Some(segment);
        self.transition(&mut inner, TurnState::UserTurnCommitted);
        let text = transcript.text.trim().to_string();
        let turn_start = {
            let mut chat = self.chat.lock();
            let dropped = chat.trim_to(self.max_context_messages.saturating_sub(1));
            if dropped > 0 {
                debug!(dropped, "Trimmed chat history");
            }
            chat.push_user(text.clone());
            chat.len()
        };
        let _ = self.events.send(SessionEvent::UserCommitted { segment, text });

        let ticket = self.open_turn(&mut inner, true, ReplyProgress::starting_at(turn_start));
        self.transition(&mut inner, TurnState::AssistantGenerating);
        TranscriptOutcome::Committed(ticket)
    }

    /// Start an assistant utterance that does not answer a user turn. Only
    /// possible while idle. Recorded utterances are appended to the chat.
    pub fn begin_utterance(&self, text: &str, interruptible: bool, record: bool) -> Option<TurnTicket> {
        let mut inner = self.inner.lock();
        if inner.state != TurnState::Idle || self.session.is_cancelled() {
            return None;
        }
        let progress = {
            let mut chat = self.chat.lock();
            if record {
                record_utterance(&mut chat, text)
            } else {
                ReplyProgress {
                    recorded: true,
                    ..ReplyProgress::starting_at(chat.len())
                }
            }
        };
        let ticket = self.open_turn(&mut inner, interruptible, progress);
        self.transition(&mut inner, TurnState::AssistantGenerating);
        Some(ticket)
    }

    /// The first frame of turn `id` was enqueued for playback.
    pub fn on_playback_started(&self, id: u64) {
        let mut inner = self.inner.lock();
        if inner.active.as_ref().is_some_and(|a| a.id == id) && inner.state == TurnState::AssistantGenerating {
            self.transition(&mut inner, TurnState::AssistantSpeaking);
        }
    }

    /// Every frame of turn `id` has been enqueued; speech after the last
    /// one has played no longer interrupts it.
    pub fn on_audio_complete(&self, id: u64) {
        if let Some(active) = self.inner.lock().active.as_mut().filter(|a| a.id == id) {
            active.audio_complete = true;
        }
    }

    /// Turn `id` finished and its audio drained. Returns false if the turn
    /// had already been superseded.
    pub fn on_turn_finished(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.active.as_ref().is_some_and(|a| a.id == id) {
            return false;
        }
        self.finish_active(&mut inner);
        true
    }

    /// Cancel whatever is in flight and return to idle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.cancel_active(&mut inner, Instant::now());
        inner.open_segment = None;
        self.transition(&mut inner, TurnState::Idle);
    }

    /// Session teardown: like [`TurnController::reset`], and no pass may
    /// deliver audio afterwards.
    pub fn shutdown(&self) {
        self.reset();
        self.outbound.close_all();
    }

    fn open_turn(&self, inner: &mut TurnInner, interruptible: bool, progress: ReplyProgress) -> TurnTicket {
        inner.next_turn += 1;
        let ticket = TurnTicket {
            id: inner.next_turn,
            pass: self.outbound.open_pass(),
            cancel: self.session.child_token(),
            playout: Arc::new(Playout::new()),
            progress: Arc::new(Mutex::new(progress)),
        };
        inner.active = Some(ActiveTurn {
            id: ticket.id,
            pass: ticket.pass,
            cancel: ticket.cancel.clone(),
            playout: Arc::clone(&ticket.playout),
            progress: Arc::clone(&ticket.progress),
            interruptible,
            audio_complete: false,
        });
        ticket
    }

    fn finish_active(&self, inner: &mut TurnInner) {
        if let Some(active) = inner.active.take() {
            self.outbound.close_pass(active.pass);
            active.progress.lock().recorded = true;
        }
        self.transition(inner, TurnState::Idle);
    }

    /// Stop the active turn: close its pass before anything else so no
    /// further frame of it is enqueued, then record what was heard.
    fn cancel_active(&self, inner: &mut TurnInner, now: Instant) -> Option<usize> {
        let active = inner.active.take()?;
        self.outbound.close_pass(active.pass);
        active.cancel.cancel();
        let spoken = active.playout.spoken_chars(now);
        let mut chat = self.chat.lock();
        let mut progress = active.progress.lock();
        record_interruption(&mut chat, &mut progress, spoken);
        Some(spoken)
    }

    fn transition(&self, inner: &mut TurnInner, to: TurnState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        debug!(%from, %to, "Turn state");
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
        if to == TurnState::Idle {
            self.idle.notify_one();
        }
    }
}
