//! Media pipeline: frame bus, VAD, text chunking, playout tracking, STT and
//! streaming TTS.

pub mod bus;
pub mod chunker;
pub mod playout;
pub mod stt;
pub mod tts;
pub mod vad;
