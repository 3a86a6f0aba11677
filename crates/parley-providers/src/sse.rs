//! Server-Sent Events line parser.
//!
//! Turns any byte stream (usually a `reqwest::Response` body) into a stream
//! of [`SseEvent`]s. Lines may be split across chunks arbitrarily.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_response(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    parse_sse_stream(response.bytes_stream())
}

/// Parse raw SSE bytes.
pub fn parse_sse_stream<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    let bytes = bytes.map(|chunk| chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {e}")));
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(bytes),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|&b| b == b'\n') {
                    // split on bytes so multi-byte characters spanning chunks survive
                    let line_bytes: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let line = line.trim_end_matches(['\n', '\r']);

                    if line.is_empty() {
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), state)),
                    None => {
                        // Stream ended. Dispatch any remaining data.
                        return state.dispatch().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
        };
        self.current_data.clear();
        Some(event)
    }
}
