//! Server-Sent Events client for transcription push streams.

use futures_util::StreamExt;
use mcp_protocol::{ErrorCode, StreamFrame, WireError};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::boundary::PushStream;
use crate::error::TransportError;

/// Frames buffered between the reader task and the session.
const FRAME_BUFFER: usize = 64;

/// Resolve a session endpoint against the server URL.
///
/// Absolute `http(s)` endpoints are used as-is. Relative ones are joined to
/// the server's origin, with `ws`/`wss` mapped to `http`/`https`.
pub fn resolve_endpoint(server_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }

    let (scheme, rest) = match server_url.split_once("://") {
        Some(("ws", rest)) => ("http", rest),
        Some(("wss", rest)) => ("https", rest),
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", server_url),
    };
    let authority = rest.split('/').next().unwrap_or(rest);

    if endpoint.starts_with('/') {
        format!("{scheme}://{authority}{endpoint}")
    } else {
        format!("{scheme}://{authority}/{endpoint}")
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Input may be split at arbitrary byte boundaries; complete events are
/// returned as soon as their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<StreamFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(StreamFrame::new(event.unwrap_or_else(|| "message".into()), data))
    }
}

/// Open an SSE stream at `url` and pump its events into a [`PushStream`].
///
/// A read failure mid-stream is delivered as an `error` frame so that the
/// owning session fails through its normal error path.
pub async fn open(http: &reqwest::Client, url: &str) -> Result<PushStream, TransportError> {
    debug!("Opening event stream {url}");
    let response = http
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(TransportError::status(status.as_u16(), message));
    }

    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let url = url.to_string();
    let reader = tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in decoder.push(&bytes) {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Event stream {url} failed: {e}");
                    let code = if e.is_timeout() {
                        ErrorCode::TimeoutError
                    } else {
                        ErrorCode::NetworkError
                    };
                    let wire = WireError::new(code.as_str(), e.to_string());
                    if let Ok(data) = serde_json::to_string(&wire) {
                        let _ = tx.send(StreamFrame::new(StreamFrame::ERROR, data)).await;
                    }
                    return;
                }
            }
        }
        debug!("Event stream {url} ended");
    });

    Ok(PushStream::new(rx, Some(reader)))
}
