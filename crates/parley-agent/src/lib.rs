//! Voice assistant runtime.
//!
//! A [`session::VoiceSession`] wires the media pipeline to a
//! [`turn::TurnController`], which decides whose turn it is, and a
//! [`generator::ResponseGenerator`], which runs the LLM with tool calls.

use std::sync::Arc;

use parking_lot::Mutex;

use parley_core::chat::ChatContext;

pub mod events;
pub mod generator;
pub mod session;
pub mod turn;

/// Conversation log shared by the controller and the generator.
pub type SharedChat = Arc<Mutex<ChatContext>>;
