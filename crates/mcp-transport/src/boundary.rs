//! The transport boundary.
//!
//! Everything the client core needs from the outside world goes through the
//! two traits below. [`McpTransport`] covers the RPC and push-event surface;
//! [`TranscriptionBackend`] covers speech sessions and their event streams.
//! Payloads cross the boundary as JSON strings or typed wire structs and are
//! validated by the client.

use std::future::Future;

use bytes::Bytes;
use mcp_protocol::{
    AudioConfig, ChunkReceipt, EndSpeechResult, EventCategory, SpeechSessionInfo, StreamFrame,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::TransportError;

/// Capacity of the push-event broadcast channel used by transports.
pub const PUSH_CHANNEL_CAPACITY: usize = 256;

/// A push event as emitted by a transport: a category and its raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPushEvent {
    pub category: EventCategory,
    pub payload: String,
}

impl RawPushEvent {
    pub fn new(category: EventCategory, payload: impl Into<String>) -> Self {
        Self {
            category,
            payload: payload.into(),
        }
    }
}

/// RPC surface of an MCP server connection.
///
/// Implementations must be cheap to share: the client holds them in an
/// `Arc` and calls them from many tasks at once.
pub trait McpTransport: Send + Sync + 'static {
    /// One-time native initialisation. Returns `false` if the transport is
    /// unusable.
    fn initialize(&self) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Open a connection to `url`. `Ok(false)` means the server declined.
    fn connect(&self, url: &str) -> impl Future<Output = Result<bool, TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Whether the underlying link is currently up.
    fn is_connected(&self) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Invoke a tool. `params_json` is a JSON object; the result is the raw
    /// JSON tool response.
    fn call_tool(
        &self,
        name: &str,
        params_json: &str,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Fetch a resource. Returns the raw JSON resource response.
    fn request_resource(&self, uri: &str) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Server metadata as JSON, or the literal `"null"` when unavailable.
    fn get_server_info(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Forward a raw protocol message to the server.
    fn handle_input(&self, message: &str) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Subscribe to server push events. Each call returns an independent
    /// receiver; dropping it removes the subscription.
    fn subscribe(&self) -> broadcast::Receiver<RawPushEvent>;
}

/// Speech transcription surface.
pub trait TranscriptionBackend: Send + Sync + 'static {
    fn start_speech_processing(
        &self,
        config: &AudioConfig,
    ) -> impl Future<Output = Result<SpeechSessionInfo, TransportError>> + Send;

    fn send_audio_chunk(
        &self,
        transcription_id: &str,
        chunk: Bytes,
    ) -> impl Future<Output = Result<ChunkReceipt, TransportError>> + Send;

    fn end_speech_processing(
        &self,
        transcription_id: &str,
    ) -> impl Future<Output = Result<EndSpeechResult, TransportError>> + Send;

    /// Open the push stream announced by `start_speech_processing`.
    fn open_stream(
        &self,
        transcription_id: &str,
        endpoint: &str,
    ) -> impl Future<Output = Result<PushStream, TransportError>> + Send;
}

// ─────────────────────────────────────────────────────────────────────────────
// Push streams
// ─────────────────────────────────────────────────────────────────────────────

/// An open per-session event stream.
///
/// Frames arrive on a channel fed by a background reader task. Closing (or
/// dropping) the stream stops that task.
#[derive(Debug)]
pub struct PushStream {
    frames: mpsc::Receiver<StreamFrame>,
    reader: Option<JoinHandle<()>>,
}

impl PushStream {
    pub fn new(frames: mpsc::Receiver<StreamFrame>, reader: Option<JoinHandle<()>>) -> Self {
        Self { frames, reader }
    }

    /// A stream fed directly through the returned sender, with no reader task.
    pub fn channel(buffer: usize) -> (mpsc::Sender<StreamFrame>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx, None))
    }

    /// Next frame, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    pub fn close(&mut self) {
        self.frames.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
