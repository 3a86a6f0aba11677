//! Gateway integration tests: start a real gateway and talk to it over WS + HTTP.
//!
//! Run with: `cargo test -p parley-gateway --test integration`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use parley_agent::generator::{GeneratorSettings, ResponseGenerator};
use parley_agent::session::VoiceAssistant;
use parley_core::audio::{AudioFormat, AudioFrame};
use parley_core::chat::ChatMessage;
use parley_core::config::{Config, GatewayAuthConfig, GatewayConfig, VoiceConfig};
use parley_media::stt::{SttBackend, SttEvent};
use parley_media::tts::{PcmStream, TtsBackend};
use parley_providers::{ChunkStream, CompletionChunk, CompletionRequest, Credentials, LlmProvider, ToolDefinition};
use parley_tools::ToolRegistry;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct EchoStt;

#[async_trait]
impl SttBackend for EchoStt {
    fn id(&self) -> &str {
        "echo"
    }

    async fn transcribe(
        &self,
        _format: AudioFormat,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> anyhow::Result<()> {
        while frames.recv().await.is_some() {}
        let _ = events.send(SttEvent::Final("hello".into()));
        Ok(())
    }
}

struct CannedLlm {
    replies: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl LlmProvider for CannedLlm {
    fn id(&self) -> &str {
        "canned"
    }

    fn format_tools(&self, _tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        Vec::new()
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages.iter().map(|m| json!({"content": m.content})).collect()
    }

    fn is_tool_use_stop(&self, _stop_reason: &str) -> bool {
        false
    }

    async fn stream(&self, _request: &CompletionRequest, _credentials: &Credentials) -> anyhow::Result<ChunkStream> {
        let reply = self.replies.lock().pop_front().unwrap_or("Sorry.");
        let chunks = vec![Ok(CompletionChunk::text(reply)), Ok(CompletionChunk::stop("stop"))];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// 1ms of audio per character.
struct ClickTts;

#[async_trait]
impl TtsBackend for ClickTts {
    fn id(&self) -> &str {
        "click"
    }

    async fn synthesize(&self, text: &str, format: AudioFormat) -> anyhow::Result<PcmStream> {
        let samples = format.samples_per_frame(1) * text.chars().count();
        Ok(Box::pin(futures::stream::iter(vec![Ok(vec![500_i16; samples])])))
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn assistant(config: &Config) -> VoiceAssistant {
    let mut voice = VoiceConfig::default();
    voice.greeting = None;
    let llm = Arc::new(CannedLlm {
        replies: Mutex::new(VecDeque::from(["Hi there."])),
    });
    let generator = ResponseGenerator::new(
        llm,
        Credentials::None,
        Arc::new(ToolRegistry::new()),
        Arc::new(config.clone()),
        GeneratorSettings::from_config(config),
    );
    VoiceAssistant::new(voice, Arc::new(EchoStt), Arc::new(ClickTts), Arc::new(generator))
}

async fn start_test_gateway(config: Config) -> (Arc<parley_gateway::GatewayState>, u16) {
    let port = find_free_port();
    let config = Arc::new(config);
    let state = Arc::new(parley_gateway::GatewayState::new(
        Arc::clone(&config),
        assistant(&config),
    ));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = parley_gateway::start_gateway(state_clone, port).await;
    });

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health")).await.is_ok() {
            break;
        }
    }
    (state, port)
}

async fn next_json(ws: &mut Socket) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read until a text event satisfies `pred`, counting audio bytes on the way.
async fn read_until<F>(ws: &mut Socket, mut pred: F) -> (serde_json::Value, usize)
where
    F: FnMut(&serde_json::Value) -> bool,
{
    let mut audio_bytes = 0;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for an event")
            .unwrap()
            .unwrap();
        match msg {
            Message::Binary(bytes) => audio_bytes += bytes.len(),
            Message::Text(text) => {
                let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&event) {
                    return (event, audio_bytes);
                }
            }
            _ => {}
        }
    }
}

async fn connect(port: u16) -> Socket {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.expect("WS connect failed");
    ws
}

fn pcm(ms: u64, amplitude: i16) -> Vec<Message> {
    let format = AudioFormat::default();
    (0..ms / 20)
        .map(|_| {
            let bytes: Vec<u8> = vec![amplitude; format.samples_per_frame(20)]
                .into_iter()
                .flat_map(|s| s.to_le_bytes())
                .collect();
            Message::Binary(bytes.into())
        })
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = start_test_gateway(Config::default()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_hello_and_session_start() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["auth_mode"], "none");
    assert_eq!(hello["sample_rate"], 16_000);
    assert_eq!(hello["channels"], 1);

    let started = next_json(&mut ws).await;
    assert_eq!(started["type"], "session_started");
    let session_id = started["session_id"].as_str().unwrap().to_string();
    assert!(state.sessions.read().await.contains_key(&session_id));

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_say_streams_audio_and_events() {
    let (_state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;
    let _hello = next_json(&mut ws).await;
    let _started = next_json(&mut ws).await;

    let say = json!({"type": "say", "text": "Hello there."});
    ws.send(Message::Text(say.to_string().into())).await.unwrap();

    let (_, audio_bytes) = read_until(&mut ws, |e| e["type"] == "state_changed" && e["to"] == "idle").await;
    // 12 characters at 1ms (16 samples) each
    assert_eq!(audio_bytes, 12 * 16 * 2);

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_spoken_turn_round_trip() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;
    let _hello = next_json(&mut ws).await;
    let started = next_json(&mut ws).await;
    let session_id = started["session_id"].as_str().unwrap().to_string();

    for msg in pcm(400, 3_000).into_iter().chain(pcm(800, 0)) {
        ws.send(msg).await.unwrap();
    }

    let (committed, _) = read_until(&mut ws, |e| e["type"] == "user_committed").await;
    assert_eq!(committed["text"], "hello");
    let (_, audio_bytes) = read_until(&mut ws, |e| {
        e["type"] == "state_changed" && e["from"] == "assistant_speaking" && e["to"] == "idle"
    })
    .await;
    assert_eq!(audio_bytes, "Hi there.".len() * 16 * 2);

    let sessions = state.snapshot().await;
    let entry = sessions.iter().find(|s| s.session_id == session_id).unwrap();
    assert_eq!(entry.turns, 1);

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_malformed_input_reports_protocol_error() {
    let (_state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;
    let _hello = next_json(&mut ws).await;
    let _started = next_json(&mut ws).await;

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let (error, _) = read_until(&mut ws, |e| e["type"] == "error").await;
    assert_eq!(error["kind"], "protocol");

    ws.send(Message::Text(r#"{"type":"dance"}"#.into())).await.unwrap();
    let (error, _) = read_until(&mut ws, |e| e["type"] == "error").await;
    assert_eq!(error["kind"], "protocol");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_token_auth_rejects_wrong_token() {
    let config = Config {
        gateway: Some(GatewayConfig {
            port: 0,
            bind: None,
            auth: Some(GatewayAuthConfig {
                mode: Some("token".into()),
                token: Some("s3cret".into()),
                token_env: None,
            }),
            max_sessions: 4,
        }),
        ..Default::default()
    };
    let (state, port) = start_test_gateway(config).await;

    let mut ws = connect(port).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["auth_mode"], "token");
    ws.send(Message::Text(json!({"type": "auth", "token": "nope"}).to_string().into()))
        .await
        .unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["kind"], "auth");
    assert!(state.sessions.read().await.is_empty());

    let mut ws = connect(port).await;
    let _hello = next_json(&mut ws).await;
    ws.send(Message::Text(json!({"type": "auth", "token": "s3cret"}).to_string().into()))
        .await
        .unwrap();
    let started = next_json(&mut ws).await;
    assert_eq!(started["type"], "session_started");
    ws.close(None).await.ok();
}
