//! Frame bus between the network transport and a voice session.
//!
//! Inbound frames travel through a bounded FIFO so a stalled session pushes
//! back on the transport. Outbound frames travel through an unbounded FIFO
//! gated by a [`PassId`]: every synthesis pass opens its own pass, and once a
//! pass is closed no frame of it can reach the transport.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use parley_core::audio::{AudioFormat, AudioFrame};
use parley_core::error::{ParleyError, Result};

/// Identifies one synthesis pass on the outbound side of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(u64);

impl std::fmt::Display for PassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pass-{}", self.0)
    }
}

pub struct AudioFrameBus;

impl AudioFrameBus {
    /// Create both ends of a bus carrying `format` audio. `capacity` bounds
    /// the inbound queue.
    pub fn new(format: AudioFormat, capacity: usize) -> (TransportLink, SessionAudio) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let link = TransportLink {
            sender: FrameSender { format, tx: in_tx },
            outbound: out_rx,
        };
        let session = SessionAudio {
            format,
            inbound: InboundAudio { rx: in_rx },
            outbound: OutboundAudio {
                format,
                tx: out_tx,
                gate: Arc::new(Mutex::new(Gate::default())),
            },
        };
        (link, session)
    }
}

/// Transport side of the bus. Dropping it (or its sender half) is how a
/// transport reports disconnection.
pub struct TransportLink {
    sender: FrameSender,
    outbound: mpsc::UnboundedReceiver<AudioFrame>,
}

impl TransportLink {
    pub fn format(&self) -> AudioFormat {
        self.sender.format
    }

    pub async fn push(&self, frame: AudioFrame) -> Result<()> {
        self.sender.push(frame).await
    }

    pub async fn push_bytes(&self, bytes: &[u8], captured_at: Duration) -> Result<()> {
        self.sender.push_bytes(bytes, captured_at).await
    }

    /// Next frame to play, or `None` once the session has ended.
    pub async fn next_outbound(&mut self) -> Option<AudioFrame> {
        self.outbound.recv().await
    }

    /// Split into halves for separate reader and writer tasks.
    pub fn split(self) -> (FrameSender, mpsc::UnboundedReceiver<AudioFrame>) {
        (self.sender, self.outbound)
    }
}

/// Inbound half of a [`TransportLink`].
#[derive(Clone)]
pub struct FrameSender {
    format: AudioFormat,
    tx: mpsc::Sender<AudioFrame>,
}

impl FrameSender {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub async fn push(&self, frame: AudioFrame) -> Result<()> {
        if frame.format() != self.format {
            return Err(ParleyError::Protocol(format!(
                "frame format {:?} does not match session format {:?}",
                frame.format(),
                self.format
            )));
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ParleyError::Transport("session no longer accepts audio".into()))
    }

    /// Decode little-endian PCM and push it.
    pub async fn push_bytes(&self, bytes: &[u8], captured_at: Duration) -> Result<()> {
        let frame = AudioFrame::from_le_bytes(bytes, self.format, captured_at)?;
        self.push(frame).await
    }
}

/// Session side of the bus.
pub struct SessionAudio {
    pub format: AudioFormat,
    pub inbound: InboundAudio,
    pub outbound: OutboundAudio,
}

pub struct InboundAudio {
    rx: mpsc::Receiver<AudioFrame>,
}

impl InboundAudio {
    /// Next captured frame, or `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct Gate {
    current: Option<PassId>,
    next: u64,
}

/// Outbound half of the bus, shared by the turn controller and synthesizer.
#[derive(Clone)]
pub struct OutboundAudio {
    format: AudioFormat,
    tx: mpsc::UnboundedSender<AudioFrame>,
    gate: Arc<Mutex<Gate>>,
}

impl OutboundAudio {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Open a new pass. Any pass still open is closed first.
    pub fn open_pass(&self) -> PassId {
        let mut gate = self.gate.lock();
        gate.next += 1;
        let pass = PassId(gate.next);
        if let Some(old) = gate.current.replace(pass) {
            trace!(%old, %pass, "Outbound pass superseded");
        }
        pass
    }

    /// Close `pass`. Returns false if it was not the open pass.
    pub fn close_pass(&self, pass: PassId) -> bool {
        let mut gate = self.gate.lock();
        if gate.current == Some(pass) {
            gate.current = None;
            true
        } else {
            false
        }
    }

    pub fn close_all(&self) {
        self.gate.lock().current = None;
    }

    pub fn is_open(&self, pass: PassId) -> bool {
        self.gate.lock().current == Some(pass)
    }

    /// Enqueue a frame for `pass`. Returns `Ok(false)` without enqueuing when
    /// the pass has been closed. The gate check and the enqueue happen under
    /// one lock, so a frame can never follow the closing of its pass.
    pub fn send(&self, frame: AudioFrame, pass: PassId) -> Result<bool> {
        if frame.format() != self.format {
            return Err(ParleyError::Protocol(format!(
                "outbound frame format {:?} does not match session format {:?}",
                frame.format(),
                self.format
            )));
        }
        let gate = self.gate.lock();
        if gate.current != Some(pass) {
            return Ok(false);
        }
        self.tx
            .send(frame)
            .map_err(|_| ParleyError::Transport("transport stopped reading audio".into()))?;
        Ok(true)
    }

    /// True once the transport side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
