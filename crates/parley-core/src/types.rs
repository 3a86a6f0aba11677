use serde::{Deserialize, Serialize};

use crate::audio::SegmentId;

/// STT output for one speech segment.
///
/// Interim transcripts may be superseded by later ones for the same segment.
/// Exactly one final transcript is produced per segment; `failed` marks the
/// empty final emitted after transcription gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub segment: SegmentId,
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl Transcript {
    pub fn interim(segment: SegmentId, text: impl Into<String>) -> Self {
        Self {
            segment,
            text: text.into(),
            is_final: false,
            failed: false,
        }
    }

    pub fn final_text(segment: SegmentId, text: impl Into<String>) -> Self {
        Self {
            segment,
            text: text.into(),
            is_final: true,
            failed: false,
        }
    }

    pub fn failed(segment: SegmentId) -> Self {
        Self {
            segment,
            text: String::new(),
            is_final: true,
            failed: true,
        }
    }

    /// Final with nothing worth committing.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Authoritative turn-taking state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    UserSpeaking,
    UserTurnCommitted,
    AssistantGenerating,
    AssistantSpeaking,
    Interrupted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::UserSpeaking => "user_speaking",
            Self::UserTurnCommitted => "user_turn_committed",
            Self::AssistantGenerating => "assistant_generating",
            Self::AssistantSpeaking => "assistant_speaking",
            Self::Interrupted => "interrupted",
        }
    }

    /// The assistant owns the floor.
    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::AssistantGenerating | Self::AssistantSpeaking)
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
