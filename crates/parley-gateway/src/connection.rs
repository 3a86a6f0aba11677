//! WebSocket connection lifecycle: handshake, auth, and the audio/event
//! pumps of one voice session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use parley_agent::events::SessionEvent;
use parley_core::config::Config;
use parley_media::bus::AudioFrameBus;

use crate::state::GatewayState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Inbound frames buffered ahead of the VAD.
const INBOUND_CAPACITY: usize = 256;

/// Text messages a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Say {
        text: String,
        #[serde(default = "default_true")]
        allow_interruptions: bool,
    },
    Reset,
    Stop,
}

fn default_true() -> bool {
    true
}

/// First text message of every connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "hello")]
pub struct Hello {
    pub version: String,
    pub auth_mode: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
}

/// Sent once the session is running.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "session_started")]
pub struct SessionStarted {
    pub session_id: String,
}

/// Determine the auth mode from config.
fn auth_mode(config: &Config) -> &str {
    config
        .gateway
        .as_ref()
        .and_then(|g| g.auth.as_ref())
        .map(|a| a.effective_mode())
        .unwrap_or("none")
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check a client-supplied token against the configured auth mode.
fn authenticate(config: &Config, token: Option<&str>) -> Result<(), String> {
    match auth_mode(config) {
        "none" => Ok(()),
        "token" => {
            let expected = config
                .gateway
                .as_ref()
                .and_then(|g| g.auth.as_ref())
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| "Server token not configured".to_string())?;
            match token {
                Some(token) if constant_time_eq(token, &expected) => Ok(()),
                Some(_) => Err("Invalid token".to_string()),
                None => Err("Token authentication required".to_string()),
            }
        }
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

fn text_message<T: Serialize>(value: &T) -> Option<Message> {
    serde_json::to_string(value).ok().map(|s| Message::Text(s.into()))
}

fn error_event(kind: &str, message: impl Into<String>) -> SessionEvent {
    SessionEvent::Error {
        kind: kind.to_string(),
        message: message.into(),
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let voice = state.assistant.voice().clone();
    let mode = auth_mode(&state.config).to_string();

    let hello = Hello {
        version: env!("CARGO_PKG_VERSION").to_string(),
        auth_mode: mode.clone(),
        sample_rate: voice.format.sample_rate,
        channels: voice.format.channels,
        frame_ms: voice.frame_ms,
    };
    if let Some(msg) = text_message(&hello) {
        if ws_tx.send(msg).await.is_err() {
            return;
        }
    }

    if mode != "none" {
        let outcome = tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&state.config, &mut ws_rx)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some("Authentication timeout".to_string()),
        };
        if let Some(reason) = failure {
            warn!(%reason, "Authentication failed");
            if let Some(msg) = text_message(&error_event("auth", reason)) {
                let _ = ws_tx.send(msg).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    }

    let (link, audio) = AudioFrameBus::new(voice.format, INBOUND_CAPACITY);
    let session = match state.assistant.start(audio) {
        Ok(session) => session,
        Err(e) => {
            error!(%e, "Failed to start voice session");
            if let Some(msg) = text_message(&error_event(e.kind(), e.to_string())) {
                let _ = ws_tx.send(msg).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.id().to_string();
    let events = session.subscribe();
    state.register(&session_id).await;
    info!(session = %session_id, "Voice connection established");

    let started = SessionStarted {
        session_id: session_id.clone(),
    };
    if let Some(msg) = text_message(&started) {
        if ws_tx.send(msg).await.is_err() {
            session.stop().await;
            state.unregister(&session_id).await;
            return;
        }
    }

    let (frames, outbound) = link.split();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut writer = tokio::spawn(write_loop(
        Arc::clone(&state),
        session_id.clone(),
        ws_tx,
        outbound,
        events,
        notice_rx,
    ));

    let format = voice.format;
    let mut captured = Duration::ZERO;
    loop {
        let msg = tokio::select! {
            _ = session.closed() => break,
            msg = ws_rx.next() => msg,
        };
        let Some(msg) = msg else {
            break;
        };
        match msg {
            Ok(Message::Binary(bytes)) => match frames.push_bytes(&bytes, captured).await {
                Ok(()) => captured += format.duration_of(bytes.len() / 2),
                Err(e) if e.is_fatal() => break,
                Err(e) => {
                    debug!(session = %session_id, %e, "Rejected audio frame");
                    let _ = notice_tx.send(error_event(e.kind(), e.to_string()));
                }
            },
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Say {
                    text,
                    allow_interruptions,
                }) => {
                    if let Err(e) = session.say(text, allow_interruptions) {
                        let _ = notice_tx.send(error_event(e.kind(), e.to_string()));
                    }
                }
                Ok(ClientMessage::Reset) => {
                    if let Err(e) = session.reset() {
                        let _ = notice_tx.send(error_event(e.kind(), e.to_string()));
                    }
                }
                Ok(ClientMessage::Stop) => {
                    debug!(session = %session_id, "Client requested stop");
                    break;
                }
                Ok(ClientMessage::Auth { .. }) => {
                    debug!(session = %session_id, "Ignoring auth message after handshake");
                }
                Err(e) => {
                    warn!(%e, "Invalid message received");
                    let _ = notice_tx.send(error_event("protocol", format!("Invalid message: {e}")));
                }
            },
            Ok(Message::Close(_)) => {
                debug!(session = %session_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(session = %session_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    drop(frames);
    session.stop().await;
    // let the writer flush the closing event
    if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    state.unregister(&session_id).await;
    info!(session = %session_id, "Voice connection closed");
}

/// Forward outbound audio, session events and connection notices to the
/// socket until the session closes or the socket fails.
async fn write_loop(
    state: Arc<GatewayState>,
    session_id: String,
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<parley_core::audio::AudioFrame>,
    mut events: broadcast::Receiver<SessionEvent>,
    mut notices: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Binary(frame.to_le_bytes().into()),
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => {
                    state.observe(&session_id, &event).await;
                    let closing = matches!(event, SessionEvent::Closed { .. });
                    if let Some(msg) = text_message(&event) {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    if closing {
                        break;
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session_id, skipped, "Client fell behind on session events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(notice) = notices.recv() => match text_message(&notice) {
                Some(msg) => msg,
                None => continue,
            },
        };
        if ws_tx.send(msg).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Wait for the client's auth message.
async fn wait_for_auth(config: &Config, ws_rx: &mut SplitStream<WebSocket>) -> Result<(), String> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Auth { token }) => authenticate(config, Some(&token)),
                    _ => authenticate(config, None),
                };
            }
            Ok(Message::Close(_)) => return Err("Connection closed during auth".to_string()),
            Err(e) => return Err(format!("WebSocket error during auth: {e}")),
            _ => continue,
        }
    }
    Err("Connection dropped during auth".to_string())
}
