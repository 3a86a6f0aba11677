//! Ledger of what a synthesis pass has handed to the transport.
//!
//! The transport plays outbound audio in real time, so every frame is
//! scheduled right after the previous one (or at enqueue time if the line
//! went quiet). Combined with the text of each chunk this tells how much of
//! a reply has actually been heard at a given instant.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Assumed speaking rate for chunks whose audio is still arriving.
const ESTIMATED_PER_CHAR: Duration = Duration::from_millis(65);

#[derive(Debug, Default)]
struct ChunkEntry {
    chars: usize,
    spans: Vec<(Instant, Duration)>,
    audio: Duration,
    closed: bool,
}

impl ChunkEntry {
    fn played(&self, now: Instant) -> Duration {
        self.spans
            .iter()
            .map(|&(start, len)| now.saturating_duration_since(start).min(len))
            .sum()
    }

    fn spoken_chars(&self, now: Instant) -> usize {
        let played = self.played(now);
        let total = if self.closed {
            self.audio
        } else {
            self.audio.max(ESTIMATED_PER_CHAR * self.chars as u32)
        };
        if total.is_zero() || played >= total {
            return self.chars;
        }
        (self.chars as u128 * played.as_micros() / total.as_micros()) as usize
    }

    fn finished_by(&self, now: Instant) -> bool {
        self.closed && self.played(now) >= self.audio
    }
}

#[derive(Debug, Default)]
struct Ledger {
    chunks: Vec<ChunkEntry>,
    playhead_end: Option<Instant>,
    first_audio_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct Playout {
    ledger: Mutex<Ledger>,
}

impl Playout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a chunk. Audio pushed until [`Playout::end_chunk`] belongs to it.
    pub fn begin_chunk(&self, text: &str) {
        let mut ledger = self.ledger.lock();
        if let Some(open) = ledger.chunks.last_mut() {
            open.closed = true;
        }
        ledger.chunks.push(ChunkEntry {
            chars: text.chars().count(),
            ..ChunkEntry::default()
        });
    }

    pub fn end_chunk(&self) {
        if let Some(open) = self.ledger.lock().chunks.last_mut() {
            open.closed = true;
        }
    }

    /// Record `len` of audio enqueued at `now`.
    pub fn push_audio(&self, len: Duration, now: Instant) {
        let mut ledger = self.ledger.lock();
        let start = ledger.playhead_end.map_or(now, |end| end.max(now));
        ledger.playhead_end = Some(start + len);
        ledger.first_audio_at.get_or_insert(start);
        if ledger.chunks.is_empty() {
            ledger.chunks.push(ChunkEntry::default());
        }
        if let Some(chunk) = ledger.chunks.last_mut() {
            chunk.audio += len;
            match chunk.spans.last_mut() {
                Some((span_start, span_len)) if *span_start + *span_len == start => *span_len += len,
                _ => chunk.spans.push((start, len)),
            }
        }
    }

    pub fn first_audio_at(&self) -> Option<Instant> {
        self.ledger.lock().first_audio_at
    }

    /// When the last enqueued frame finishes playing.
    pub fn drained_at(&self) -> Option<Instant> {
        self.ledger.lock().playhead_end
    }

    pub fn is_playing(&self, now: Instant) -> bool {
        self.ledger
            .lock()
            .playhead_end
            .is_some_and(|end| end > now)
    }

    /// Audio played so far.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.ledger.lock().chunks.iter().map(|c| c.played(now)).sum()
    }

    /// Characters of chunk text heard by `now`. Within a chunk, characters
    /// are assumed to be spread evenly over its audio.
    pub fn spoken_chars(&self, now: Instant) -> usize {
        let ledger = self.ledger.lock();
        let mut spoken = 0;
        for chunk in &ledger.chunks {
            // silent chunks count as soon as everything before them was heard
            if chunk.finished_by(now) {
                spoken += chunk.chars;
                continue;
            }
            spoken += chunk.spoken_chars(now);
            break;
        }
        spoken
    }
}
