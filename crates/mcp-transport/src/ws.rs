//! JSON-RPC 2.0 over WebSocket.
//!
//! One socket per transport. A writer task drains an outgoing queue into the
//! socket; a reader task resolves pending requests by id and turns server
//! notifications into push events. When the socket drops without a manual
//! disconnect, a `connection_lost` error event is broadcast.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mcp_protocol::{
    AudioConfig, ChunkReceipt, EndSpeechResult, ErrorEvent, EventCategory, IncomingMessage,
    JsonRpcRequest, JsonRpcResponse, Methods, Notifications, RequestId, SpeechSessionInfo,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::boundary::{
    McpTransport, PUSH_CHANNEL_CAPACITY, PushStream, RawPushEvent, TranscriptionBackend,
};
use crate::error::TransportError;
use crate::sse;

type PendingMap = DashMap<i64, oneshot::Sender<Result<Value, TransportError>>>;

/// Settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Deadline for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Deadline for a single JSON-RPC request.
    pub request_timeout: Duration,
    /// Name announced in the `initialize` handshake.
    pub client_name: String,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: "mcp-voice".into(),
        }
    }
}

/// Production transport: JSON-RPC over a WebSocket, SSE for speech streams.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: WsTransportConfig,
    http: reqwest::Client,
    server_url: Mutex<Option<String>>,
    /// Outgoing queue (present while a socket is open)
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    pending: PendingMap,
    next_id: AtomicI64,
    connected: AtomicBool,
    /// Set by `disconnect` so the reader does not report a lost connection
    closing: AtomicBool,
    events: broadcast::Sender<RawPushEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let (events, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                http: reqwest::Client::new(),
                server_url: Mutex::new(None),
                outgoing: Mutex::new(None),
                pending: DashMap::new(),
                next_id: AtomicI64::new(1),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Send a JSON-RPC request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let outgoing = self
            .inner
            .outgoing
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Network("WebSocket is not connected".into()))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _pending = PendingGuard {
            pending: &self.inner.pending,
            id,
        };
        debug!("→ {method} (id {id})");

        if outgoing.send(Message::Text(text.into())).await.is_err() {
            return Err(TransportError::Network("WebSocket writer closed".into()));
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Network("connection closed before response".into())),
            Err(_) => Err(TransportError::Timeout(format!("{method} got no response"))),
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError> {
        let value = self.request(method, Some(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn shutdown_tasks(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        *self.inner.outgoing.lock() = None;
        fail_pending(&self.inner.pending, "connection closed");
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(WsTransportConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Drops a request's pending entry when the request finishes or is cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let ids: Vec<i64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Network(reason.to_string())));
        }
    }
}

fn handle_incoming(inner: &Inner, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Dropping non-JSON frame from server: {e}");
            return;
        }
    };

    match IncomingMessage::classify(value) {
        Some(IncomingMessage::Response(response)) => resolve_response(inner, response),
        Some(IncomingMessage::Notification(notification)) => {
            let Some(category) = Notifications::category(&notification.method) else {
                debug!("Ignoring notification {}", notification.method);
                return;
            };
            let payload = notification.params.unwrap_or(Value::Null).to_string();
            // No receivers is fine
            let _ = inner.events.send(RawPushEvent::new(category, payload));
        }
        None => warn!("Dropping unrecognised message from server"),
    }
}

fn resolve_response(inner: &Inner, response: JsonRpcResponse) {
    let id = match &response.id {
        Some(RequestId::Number(n)) => *n,
        Some(RequestId::String(s)) => match s.parse() {
            Ok(n) => n,
            Err(_) => return,
        },
        None => {
            if let Some(err) = response.error {
                warn!("Server error without request id: {}", err.message);
            }
            return;
        }
    };

    let Some((_, tx)) = inner.pending.remove(&id) else {
        debug!("Response for unknown request id {id}");
        return;
    };

    let result = match response.error {
        Some(err) => {
            let code = match err.classify() {
                Some(code) => code.as_str().to_string(),
                None => err.data_code().map(str::to_string).unwrap_or_else(|| err.code.to_string()),
            };
            Err(TransportError::coded(code, err.message))
        }
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(result);
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary implementations
// ─────────────────────────────────────────────────────────────────────────────

impl McpTransport for WsTransport {
    async fn initialize(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn connect(&self, url: &str) -> Result<bool, TransportError> {
        if self.inner.connected.load(Ordering::Acquire)
            && self.inner.server_url.lock().as_deref() == Some(url)
        {
            return Ok(true);
        }
        self.inner.connected.store(false, Ordering::Release);
        self.shutdown_tasks();

        info!("Connecting to {url}");
        let (socket, _) = tokio::time::timeout(self.inner.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(format!("WebSocket handshake with {url}")))??;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    warn!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => handle_incoming(&inner, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }

            let was_connected = inner.connected.swap(false, Ordering::AcqRel);
            *inner.outgoing.lock() = None;
            fail_pending(&inner.pending, "connection lost");
            if was_connected && !inner.closing.load(Ordering::Acquire) {
                warn!("Connection to server lost");
                let event = ErrorEvent::connection_lost("WebSocket connection closed unexpectedly");
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = inner.events.send(RawPushEvent::new(EventCategory::Error, payload));
                }
            }
        });

        *self.inner.outgoing.lock() = Some(out_tx);
        self.inner.tasks.lock().extend([writer, reader]);
        *self.inner.server_url.lock() = Some(url.to_string());
        self.inner.closing.store(false, Ordering::Release);

        let handshake = self
            .request(
                Methods::INITIALIZE,
                Some(json!({ "clientInfo": { "name": self.inner.config.client_name } })),
            )
            .await;
        if let Err(e) = handshake {
            self.shutdown_tasks();
            return Err(e);
        }

        self.inner.connected.store(true, Ordering::Release);
        info!("Connected to {url}");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, TransportError> {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.connected.store(false, Ordering::Release);
        let outgoing = self.inner.outgoing.lock().clone();
        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Message::Close(None)).await;
        }
        self.shutdown_tasks();
        info!("Disconnected");
        Ok(true)
    }

    async fn is_connected(&self) -> Result<bool, TransportError> {
        Ok(self.inner.connected.load(Ordering::Acquire))
    }

    async fn call_tool(&self, name: &str, params_json: &str) -> Result<String, TransportError> {
        let arguments: Value = serde_json::from_str(params_json)?;
        let result = self
            .request(Methods::TOOLS_CALL, Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        Ok(result.to_string())
    }

    async fn request_resource(&self, uri: &str) -> Result<String, TransportError> {
        let result = self.request(Methods::RESOURCES_READ, Some(json!({ "uri": uri }))).await?;
        Ok(result.to_string())
    }

    async fn get_server_info(&self) -> Result<String, TransportError> {
        let result = self.request(Methods::SERVER_INFO, None).await?;
        Ok(result.to_string())
    }

    async fn handle_input(&self, message: &str) -> Result<bool, TransportError> {
        let message = serde_json::from_str::<Value>(message).unwrap_or_else(|_| Value::String(message.into()));
        let result = self.request(Methods::INPUT_HANDLE, Some(json!({ "message": message }))).await?;
        Ok(result.as_bool().unwrap_or(true))
    }

    fn subscribe(&self) -> broadcast::Receiver<RawPushEvent> {
        self.inner.events.subscribe()
    }
}

impl TranscriptionBackend for WsTransport {
    async fn start_speech_processing(&self, config: &AudioConfig) -> Result<SpeechSessionInfo, TransportError> {
        self.request_as(Methods::SPEECH_START, serde_json::to_value(config)?).await
    }

    async fn send_audio_chunk(&self, transcription_id: &str, chunk: Bytes) -> Result<ChunkReceipt, TransportError> {
        self.request_as(
            Methods::SPEECH_CHUNK,
            json!({ "transcriptionId": transcription_id, "audio": BASE64.encode(&chunk) }),
        )
        .await
    }

    async fn end_speech_processing(&self, transcription_id: &str) -> Result<EndSpeechResult, TransportError> {
        self.request_as(Methods::SPEECH_END, json!({ "transcriptionId": transcription_id }))
            .await
    }

    async fn open_stream(&self, transcription_id: &str, endpoint: &str) -> Result<PushStream, TransportError> {
        let server_url = self
            .inner
            .server_url
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Network("WebSocket is not connected".into()))?;
        let url = sse::resolve_endpoint(&server_url, endpoint);
        debug!("Opening stream for transcription {transcription_id}");
        sse::open(&self.inner.http, &url).await
    }
}
