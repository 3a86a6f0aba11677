use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    /// STT backend stream failure.
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// LLM backend failure or tool-loop failure.
    #[error("Generation error: {0}")]
    Generation(String),

    /// TTS backend failure.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// A tool raised or received malformed arguments.
    #[error("Tool invocation error: {0}")]
    ToolInvocation(String),

    /// Stale/out-of-order events or malformed frames.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Short label used in session events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transcription(_) => "transcription",
            Self::Generation(_) => "generation",
            Self::Synthesis(_) => "synthesis",
            Self::ToolInvocation(_) => "tool_invocation",
            Self::Protocol(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    /// Whether the error ends the session rather than degrading one turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(ParleyError::Generation("x".into()).kind(), "generation");
        assert_eq!(ParleyError::Protocol("x".into()).kind(), "protocol");
        let io = ParleyError::from(std::io::Error::other("boom"));
        assert_eq!(io.kind(), "io");
    }

    #[test]
    fn test_only_transport_and_config_are_fatal() {
        assert!(ParleyError::Transport("closed".into()).is_fatal());
        assert!(!ParleyError::Synthesis("tts down".into()).is_fatal());
        assert!(!ParleyError::Transcription("stt down".into()).is_fatal());
    }
}
