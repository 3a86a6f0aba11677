//! Events a session publishes to its observers (gateway clients, metrics,
//! logs).

use serde::{Deserialize, Serialize};

use parley_core::audio::SegmentId;
use parley_core::types::TurnState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    Transcript {
        segment: SegmentId,
        text: String,
        is_final: bool,
    },
    UserCommitted {
        segment: SegmentId,
        text: String,
    },
    AssistantDelta {
        text: String,
    },
    ToolCalled {
        name: String,
        arguments: serde_json::Value,
    },
    Interrupted {
        spoken_chars: usize,
    },
    Error {
        kind: String,
        message: String,
    },
    Closed {
        reason: String,
    },
}
