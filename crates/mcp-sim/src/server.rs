//! The simulated server.
//!
//! [`SimServer`] implements both transport traits in-process. It serves the
//! four demo tools, a small resource table, and speech sessions whose `end`
//! streams a canned phrase word by word before classifying it. Every
//! operation consults the configured [`FaultPolicy`] first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use mcp_protocol::{
    AudioConfig, ChunkReceipt, ConnectionStateEvent, ContentItem, EndSpeechResult, ErrorCode,
    ErrorEvent, EventCategory, McpEvent, ResourceContent, ResourceResponse, ServerInfo,
    SpeechSessionInfo, StreamFrame, ToolCallResponse, ToolDescriptor, ToolParameters,
    TranscriptionEvent,
};
use mcp_transport::{
    McpTransport, PUSH_CHANNEL_CAPACITY, PushStream, RawPushEvent, TranscriptionBackend,
    TransportError,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::fault::{Fault, FaultPolicy, NoFaults, Operation, WordFate};

const STREAM_BUFFER: usize = 256;

const NOISE_WORDS: &[&str] = &["um", "uh", "like", "so", "well", "actually", "maybe", "I think"];

const SIMILAR_WORDS: &[(&str, &[&str])] = &[
    ("meeting", &["meting", "eating", "greeting"]),
    ("remind", &["rewind", "remained"]),
    ("note", &["boat", "vote", "goat"]),
    ("tomorrow", &["to borrow", "tomorrows"]),
    ("afternoon", &["after noon", "afternoons"]),
    ("milk", &["silk", "milked"]),
    ("call", &["tall", "cole"]),
];

const PHRASES: &[&str] = &[
    "schedule a team meeting tomorrow at three in the afternoon",
    "book a client meeting on Monday morning from nine to eleven",
    "schedule the product review on Friday at two thirty",
    "remind me to call mom at eight tonight",
    "remind me to bring the signed documents to the office tomorrow",
    "remember to buy milk eggs and bread",
    "take a note the release needs a new settings page and two bug fixes",
    "note down the shopping list new keyboard monitor stand and webcam",
    "record the key points of today's planning session",
    "what is the weather going to be like this weekend",
];

/// Outcome of classifying free text, as the server's assistant would.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub target_system: &'static str,
    pub operation: &'static str,
    pub details: Value,
}

/// Route free text to Calendar, Reminders, Notes, or the generic Assistant.
pub fn classify_text(text: &str) -> Classification {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let now = Utc::now();

    if has(&["schedule", "meeting", "calendar", "appointment", "book"]) {
        Classification {
            target_system: "Calendar",
            operation: "createEvent",
            details: json!({
                "title": format!("Meeting: {}", truncate(text, 30)),
                "startTime": (now + chrono::Duration::hours(24)).to_rfc3339(),
                "duration": 60,
            }),
        }
    } else if has(&["remind", "todo", "to-do", "remember"]) {
        let title = lower.replace("remind me to", "").replace("remember to", "");
        Classification {
            target_system: "Reminders",
            operation: "createReminder",
            details: json!({
                "title": title.trim(),
                "dueDate": (now + chrono::Duration::hours(12)).to_rfc3339(),
            }),
        }
    } else if has(&["note", "record", "write down"]) {
        Classification {
            target_system: "Notes",
            operation: "createNote",
            details: json!({
                "title": format!("Note: {}...", truncate(text, 30)),
                "content": text,
                "createdAt": now.to_rfc3339(),
            }),
        }
    } else {
        Classification {
            target_system: "Assistant",
            operation: "respondToQuery",
            details: json!({
                "response": format!("I have processed your request: \"{text}\". Anything else?"),
            }),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn demo_tools() -> Vec<ToolDescriptor> {
    let tool = |name: &str, description: &str, schema: Value| ToolDescriptor {
        name: name.into(),
        description: description.into(),
        parameters_schema: schema,
    };
    vec![
        tool(
            "createCalendarEvent",
            "Create a calendar event",
            json!({
                "type": "object",
                "required": ["title", "startTime"],
                "properties": {
                    "title": {"type": "string"},
                    "startTime": {"type": "string"},
                    "endTime": {"type": "string"},
                    "location": {"type": "string"},
                    "description": {"type": "string"},
                }
            }),
        ),
        tool(
            "createReminder",
            "Create a reminder",
            json!({
                "type": "object",
                "required": ["title"],
                "properties": {
                    "title": {"type": "string"},
                    "dueDate": {"type": "string"},
                    "priority": {"type": "string", "enum": ["low", "medium", "high"]},
                    "notes": {"type": "string"},
                }
            }),
        ),
        tool(
            "createNote",
            "Create a note",
            json!({
                "type": "object",
                "required": ["title", "content"],
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "folder": {"type": "string"},
                }
            }),
        ),
        tool(
            "processUserInput",
            "Classify free text and act on it",
            json!({
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string"}}
            }),
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

struct SimSession {
    frames: mpsc::Sender<StreamFrame>,
    /// Handed out once by `open_stream`
    stream: Option<PushStream>,
    bytes_received: usize,
}

struct SimInner {
    name: String,
    version: String,
    faults: Arc<dyn FaultPolicy>,
    connected: AtomicBool,
    url: Mutex<Option<String>>,
    events: broadcast::Sender<RawPushEvent>,
    resources: DashMap<String, ResourceContent>,
    sessions: DashMap<String, SimSession>,
    transcript: Mutex<Option<String>>,

    connect_calls: AtomicUsize,
    connect_urls: Mutex<Vec<String>>,
    connects_in_flight: AtomicUsize,
    peak_concurrent_connects: AtomicUsize,
    rpc_calls: AtomicUsize,
}

/// In-process MCP + transcription server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimServer {
    inner: Arc<SimInner>,
}

impl SimServer {
    pub fn new(faults: impl FaultPolicy) -> Self {
        Self::with_policy(Arc::new(faults))
    }

    /// A reliable, zero-latency server.
    pub fn reliable() -> Self {
        Self::new(NoFaults)
    }

    pub fn with_policy(faults: Arc<dyn FaultPolicy>) -> Self {
        let (events, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let resources = DashMap::new();
        for (uri, text) in [
            ("notes://welcome", "Welcome to the simulated MCP server."),
            ("calendar://today", "No events scheduled for today."),
            ("reminders://pending", "Buy milk\nCall the dentist"),
        ] {
            resources.insert(
                uri.to_string(),
                ResourceContent {
                    uri: uri.into(),
                    text: text.into(),
                    mime_type: Some("text/plain".into()),
                },
            );
        }

        Self {
            inner: Arc::new(SimInner {
                name: "Simulated MCP Server".into(),
                version: "1.0.0".into(),
                faults,
                connected: AtomicBool::new(false),
                url: Mutex::new(None),
                events,
                resources,
                sessions: DashMap::new(),
                transcript: Mutex::new(None),
                connect_calls: AtomicUsize::new(0),
                connect_urls: Mutex::new(Vec::new()),
                connects_in_flight: AtomicUsize::new(0),
                peak_concurrent_connects: AtomicUsize::new(0),
                rpc_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fix the phrase streamed by every session instead of picking one.
    pub fn set_transcript(&self, text: impl Into<String>) {
        *self.inner.transcript.lock() = Some(text.into());
    }

    pub fn add_resource(&self, uri: impl Into<String>, text: impl Into<String>) {
        let uri = uri.into();
        self.inner.resources.insert(
            uri.clone(),
            ResourceContent {
                uri,
                text: text.into(),
                mime_type: Some("text/plain".into()),
            },
        );
    }

    // ── Observation ─────────────────────────────────────────────────────

    /// Number of times `connect` was invoked.
    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Endpoints passed to `connect`, in call order.
    pub fn connect_urls(&self) -> Vec<String> {
        self.inner.connect_urls.lock().clone()
    }

    /// Highest number of `connect` calls that were running at once.
    pub fn peak_concurrent_connects(&self) -> usize {
        self.inner.peak_concurrent_connects.load(Ordering::SeqCst)
    }

    /// Number of tool, resource, and input requests that reached the server.
    pub fn rpc_calls(&self) -> usize {
        self.inner.rpc_calls.load(Ordering::SeqCst)
    }

    pub fn is_link_up(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn bytes_received(&self, transcription_id: &str) -> Option<usize> {
        self.inner.sessions.get(transcription_id).map(|s| s.bytes_received)
    }

    /// Number of live push-event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    // ── Injection ───────────────────────────────────────────────────────

    /// Push a typed event to every subscriber.
    pub fn emit(&self, event: &McpEvent) {
        match event.payload_json() {
            Ok(payload) => self.emit_raw(event.category(), payload),
            Err(e) => warn!("Failed to encode simulated event: {e}"),
        }
    }

    /// Push a raw payload, which need not be valid JSON.
    pub fn emit_raw(&self, category: EventCategory, payload: impl Into<String>) {
        let _ = self.inner.events.send(RawPushEvent::new(category, payload));
    }

    /// Drop the link as if the network failed.
    pub fn drop_connection(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            info!("Simulated connection drop");
            self.emit(&McpEvent::Error(ErrorEvent::connection_lost(
                "Simulated network drop",
            )));
        }
    }

    /// Stop a session's stream from the server side.
    pub async fn stop_session(&self, transcription_id: &str) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(transcription_id) else {
            return false;
        };
        let stop = TranscriptionEvent::Stop {
            transcription_id: transcription_id.to_string(),
        };
        session.frames.send(StreamFrame::from_event(&stop)).await.is_ok()
    }

    /// Push a raw frame onto a live session stream. The data need not be
    /// well formed.
    pub async fn push_frame(&self, transcription_id: &str, frame: StreamFrame) -> bool {
        let Some(frames) = self.inner.sessions.get(transcription_id).map(|s| s.frames.clone()) else {
            return false;
        };
        frames.send(frame).await.is_ok()
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn pause(&self, latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Apply latency and any injected fault for `op`.
    async fn simulate(&self, op: Operation) -> Result<(), Fault> {
        let latency = self.inner.faults.latency(op);
        match self.inner.faults.fault(op) {
            Some(Fault::Timeout) => {
                self.pause(latency * 2).await;
                Err(Fault::Timeout)
            }
            Some(fault) => {
                self.pause(latency / 4).await;
                Err(fault)
            }
            None => {
                self.pause(latency).await;
                Ok(())
            }
        }
    }

    async fn simulate_request(&self, op: Operation) -> Result<(), TransportError> {
        self.simulate(op).await.map_err(|fault| fault_error(op, fault))
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Network("not connected to simulated server".into()))
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.inner.name.clone(),
            version: self.inner.version.clone(),
            tools: demo_tools(),
        }
    }

    fn pick_phrase(&self) -> String {
        if let Some(text) = self.inner.transcript.lock().clone() {
            return text;
        }
        let index = rand::rng().random_range(0..PHRASES.len());
        PHRASES[index].to_string()
    }

    fn run_tool(&self, name: &str, params: &ToolParameters) -> Result<ToolCallResponse, TransportError> {
        let text_param = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
        let require = |key: &str| {
            text_param(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| TransportError::coded("validation_error", format!("'{key}' is required")))
        };

        let response = match name {
            "createCalendarEvent" => {
                let title = require("title")?;
                let start = require("startTime")?;
                ToolCallResponse::from_text(format!("Created calendar event \"{title}\" at {start}"))
            }
            "createReminder" => {
                let title = require("title")?;
                ToolCallResponse::from_text(format!("Created reminder \"{title}\""))
            }
            "createNote" => {
                let title = require("title")?;
                require("content")?;
                ToolCallResponse::from_text(format!("Created note \"{title}\""))
            }
            "processUserInput" => {
                let text = require("text")?;
                if self.inner.faults.processing_fails() {
                    return Ok(ToolCallResponse {
                        content: vec![ContentItem::error("Failed to process the text, please retry")],
                        metadata: None,
                    });
                }
                let classification = classify_text(&text);
                let mut response = ToolCallResponse::from_text(
                    json!({
                        "success": true,
                        "targetSystem": classification.target_system,
                        "operation": classification.operation,
                        "details": classification.details,
                    })
                    .to_string(),
                );
                response.metadata = Some(
                    [("targetSystem".to_string(), json!(classification.target_system))]
                        .into_iter()
                        .collect(),
                );
                response
            }
            other => ToolCallResponse {
                content: vec![ContentItem::error(format!("Unknown tool: {other}"))],
                metadata: None,
            },
        };
        Ok(response)
    }

    /// Stream `phrase` word by word into a session, applying word fates.
    /// Returns without a closing frame if the stream failed mid-way.
    async fn stream_phrase(&self, transcription_id: &str, frames: &mpsc::Sender<StreamFrame>, phrase: &str) {
        let faults = &self.inner.faults;
        let words: Vec<&str> = phrase.split_whitespace().collect();
        let mut transcript = String::new();

        for (i, word) in words.iter().enumerate() {
            let word = match faults.word(i) {
                WordFate::Deliver => word.to_string(),
                WordFate::Misrecognize => misrecognize(word),
                WordFate::Drop => continue,
                WordFate::Fail(code) => {
                    let error = TranscriptionEvent::Error {
                        code,
                        message: code.default_message().to_string(),
                    };
                    let _ = frames.send(StreamFrame::from_event(&error)).await;
                    return;
                }
            };

            if !transcript.is_empty() {
                transcript.push(' ');
            }
            transcript.push_str(&word);
            if faults.noise() {
                let index = rand::rng().random_range(0..NOISE_WORDS.len());
                transcript.push(' ');
                transcript.push_str(NOISE_WORDS[index]);
            }

            let partial = TranscriptionEvent::Partial {
                text: transcript.clone(),
                confidence: faults.confidence(false),
                is_final: i + 1 == words.len(),
            };
            if frames.send(StreamFrame::from_event(&partial)).await.is_err() {
                return;
            }
            self.pause(faults.latency(Operation::EndSpeech)).await;
        }

        let closing = if faults.processing_fails() {
            TranscriptionEvent::Error {
                code: ErrorCode::TranscriptionFailed,
                message: "Transcription processing failed, please retry".into(),
            }
        } else {
            TranscriptionEvent::Complete {
                transcription_id: transcription_id.to_string(),
                text: phrase.to_string(),
                confidence: faults.confidence(true),
            }
        };
        let _ = frames.send(StreamFrame::from_event(&closing)).await;
    }
}

fn misrecognize(word: &str) -> String {
    let lower = word.to_lowercase();
    match SIMILAR_WORDS.iter().find(|(w, _)| *w == lower) {
        Some((_, options)) => {
            let index = rand::rng().random_range(0..options.len());
            options[index].to_string()
        }
        None => word.to_string(),
    }
}

fn fault_error(op: Operation, fault: Fault) -> TransportError {
    match fault {
        Fault::Network => TransportError::Network("Network connection interrupted".into()),
        Fault::Timeout => TransportError::Timeout(format!("{op:?} took too long")),
        Fault::ServerOverload => TransportError::status(503, "Server overloaded, try again later"),
        Fault::Coded(code) => TransportError::coded(code.as_str(), code.default_message()),
        Fault::Decline => TransportError::Other(format!("{op:?} declined")),
    }
}

/// Decrements the in-flight connect counter on every exit path.
struct ConnectGuard<'a>(&'a AtomicUsize);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport traits
// ─────────────────────────────────────────────────────────────────────────────

impl McpTransport for SimServer {
    async fn initialize(&self) -> Result<bool, TransportError> {
        debug!("Simulated transport initialized");
        Ok(true)
    }

    async fn connect(&self, url: &str) -> Result<bool, TransportError> {
        let inner = &self.inner;
        inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        inner.connect_urls.lock().push(url.to_string());
        let now = inner.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_concurrent_connects.fetch_max(now, Ordering::SeqCst);
        let _guard = ConnectGuard(&inner.connects_in_flight);

        match self.simulate(Operation::Connect).await {
            Ok(()) => {}
            Err(Fault::Decline) => return Ok(false),
            Err(fault) => return Err(fault_error(Operation::Connect, fault)),
        }

        inner.connected.store(true, Ordering::SeqCst);
        *inner.url.lock() = Some(url.to_string());
        info!("Simulated server accepted connection from {url}");
        self.emit(&McpEvent::ConnectionState(ConnectionStateEvent {
            connected: true,
            server_name: Some(inner.name.clone()),
        }));
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, TransportError> {
        let result = self.simulate_request(Operation::Disconnect).await;
        // The link goes down even when the server reports a failure
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.emit(&McpEvent::ConnectionState(ConnectionStateEvent {
                connected: false,
                server_name: None,
            }));
        }
        result.map(|()| true)
    }

    async fn is_connected(&self) -> Result<bool, TransportError> {
        Ok(self.inner.connected.load(Ordering::SeqCst))
    }

    async fn call_tool(&self, name: &str, params_json: &str) -> Result<String, TransportError> {
        self.inner.rpc_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        self.simulate_request(Operation::CallTool).await?;

        let params: ToolParameters = serde_json::from_str(params_json)?;
        let response = self.run_tool(name, &params)?;
        debug!("Simulated tool {name} answered");
        Ok(serde_json::to_string(&response)?)
    }

    async fn request_resource(&self, uri: &str) -> Result<String, TransportError> {
        self.inner.rpc_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        self.simulate_request(Operation::RequestResource).await?;

        let content = self
            .inner
            .resources
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::coded("404", format!("No resource at {uri}")))?;
        let response = ResourceResponse {
            contents: vec![content],
            metadata: None,
        };
        Ok(serde_json::to_string(&response)?)
    }

    async fn get_server_info(&self) -> Result<String, TransportError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Ok("null".into());
        }
        self.simulate_request(Operation::ServerInfo).await?;
        Ok(serde_json::to_string(&self.server_info())?)
    }

    async fn handle_input(&self, message: &str) -> Result<bool, TransportError> {
        self.inner.rpc_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        self.simulate_request(Operation::HandleInput).await?;
        debug!("Simulated server handled {} bytes of input", message.len());
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<RawPushEvent> {
        self.inner.events.subscribe()
    }
}

impl TranscriptionBackend for SimServer {
    async fn start_speech_processing(&self, config: &AudioConfig) -> Result<SpeechSessionInfo, TransportError> {
        self.simulate_request(Operation::StartSpeech).await?;

        let transcription_id = format!("trans_{}", uuid::Uuid::new_v4().simple());
        let sse_endpoint = format!("/api/transcription/{transcription_id}/stream");
        let (frames, stream) = PushStream::channel(STREAM_BUFFER);
        self.inner.sessions.insert(
            transcription_id.clone(),
            SimSession {
                frames,
                stream: Some(stream),
                bytes_received: 0,
            },
        );

        info!(
            "Simulated speech session {transcription_id} started ({} @ {} Hz)",
            config.format, config.sample_rate
        );
        Ok(SpeechSessionInfo {
            transcription_id,
            sse_endpoint,
        })
    }

    async fn send_audio_chunk(&self, transcription_id: &str, chunk: Bytes) -> Result<ChunkReceipt, TransportError> {
        self.simulate_request(Operation::AudioChunk).await?;

        let mut session = self
            .inner
            .sessions
            .get_mut(transcription_id)
            .ok_or_else(|| TransportError::coded("resource_not_found", format!("No session {transcription_id}")))?;
        session.bytes_received += chunk.len();
        Ok(ChunkReceipt { received: true })
    }

    async fn end_speech_processing(&self, transcription_id: &str) -> Result<EndSpeechResult, TransportError> {
        let failed = |error: String| EndSpeechResult {
            success: false,
            transcription: String::new(),
            confidence: None,
            target_system: Some("None".into()),
            operation: Some("speechProcessing".into()),
            details: None,
            error: Some(error),
        };

        if let Err(fault) = self.simulate(Operation::EndSpeech).await {
            self.inner.sessions.remove(transcription_id);
            let error = fault_error(Operation::EndSpeech, fault);
            warn!("Simulated speech session {transcription_id} failed: {error}");
            return Ok(failed(format!("Speech processing failed: {}", error.detail())));
        }
        if self.inner.faults.processing_fails() {
            self.inner.sessions.remove(transcription_id);
            return Ok(failed("Speech processing failed, please retry".into()));
        }

        let phrase = self.pick_phrase();
        if let Some((_, session)) = self.inner.sessions.remove(transcription_id) {
            self.stream_phrase(transcription_id, &session.frames, &phrase).await;
        }

        let classification = classify_text(&phrase);
        info!(
            "Simulated speech session {transcription_id} ended → {}",
            classification.target_system
        );
        Ok(EndSpeechResult {
            success: true,
            transcription: phrase,
            confidence: Some(self.inner.faults.confidence(true)),
            target_system: Some(classification.target_system.into()),
            operation: Some(classification.operation.into()),
            details: Some(classification.details),
            error: None,
        })
    }

    async fn open_stream(&self, transcription_id: &str, _endpoint: &str) -> Result<PushStream, TransportError> {
        if let Some(fault) = self.inner.faults.fault(Operation::OpenStream) {
            return Err(fault_error(Operation::OpenStream, fault));
        }
        let mut session = self
            .inner
            .sessions
            .get_mut(transcription_id)
            .ok_or_else(|| TransportError::coded("404", format!("No session {transcription_id}")))?;
        session
            .stream
            .take()
            .ok_or_else(|| TransportError::Other(format!("Stream for {transcription_id} already opened")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::ScriptedFaults;

    #[test]
    fn classifies_text_by_keyword() {
        assert_eq!(classify_text("Schedule a meeting tomorrow").target_system, "Calendar");
        assert_eq!(classify_text("remind me to buy milk").target_system, "Reminders");
        assert_eq!(
            classify_text("remind me to buy milk").details["title"],
            "buy milk"
        );
        assert_eq!(classify_text("take a note about the launch").target_system, "Notes");
        assert_eq!(classify_text("how tall is everest").operation, "respondToQuery");
    }

    #[tokio::test]
    async fn tool_calls_require_connection() {
        let server = SimServer::reliable();
        let err = server.call_tool("createNote", "{}").await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
        assert_eq!(server.rpc_calls(), 1);
    }

    #[tokio::test]
    async fn missing_required_parameter_is_validation_error() {
        let server = SimServer::reliable();
        server.connect("sim://local").await.unwrap();

        let err = server.call_tool("createReminder", "{}").await.unwrap_err();
        match err {
            TransportError::Coded { code, .. } => assert_eq!(code, "validation_error"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_content() {
        let server = SimServer::reliable();
        server.connect("sim://local").await.unwrap();

        let raw = server.call_tool("launchRocket", "{}").await.unwrap();
        let response: ToolCallResponse = serde_json::from_str(&raw).unwrap();
        assert!(response.error_item().is_some());
    }

    #[tokio::test]
    async fn scripted_connect_faults() {
        let server = SimServer::new(
            ScriptedFaults::new()
                .fail(Operation::Connect, Fault::ServerOverload)
                .fail(Operation::Connect, Fault::Decline),
        );

        let err = server.connect("sim://local").await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
        assert!(!server.connect("sim://local").await.unwrap());
        assert!(server.connect("sim://local").await.unwrap());
        assert_eq!(server.connect_calls(), 3);
        assert!(server.is_link_up());
    }

    #[tokio::test]
    async fn speech_session_streams_phrase_then_completes() {
        let server = SimServer::reliable();
        server.set_transcript("remind me to call mom");

        let info = server.start_speech_processing(&AudioConfig::default()).await.unwrap();
        let mut stream = server.open_stream(&info.transcription_id, &info.sse_endpoint).await.unwrap();
        server
            .send_audio_chunk(&info.transcription_id, Bytes::from_static(&[0u8; 320]))
            .await
            .unwrap();
        assert_eq!(server.bytes_received(&info.transcription_id), Some(320));

        let result = server.end_speech_processing(&info.transcription_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.target_system.as_deref(), Some("Reminders"));

        let mut events = Vec::new();
        while let Some(frame) = stream.next().await {
            events.push(TranscriptionEvent::from_frame(&frame).unwrap().unwrap());
        }
        assert_eq!(events.len(), 6);
        assert!(matches!(
            events.last(),
            Some(TranscriptionEvent::Complete { text, .. }) if text == "remind me to call mom"
        ));
        assert_eq!(server.open_sessions(), 0);
    }

    #[tokio::test]
    async fn word_failure_ends_stream_without_complete() {
        let server = SimServer::new(
            ScriptedFaults::new().word_fate(1, WordFate::Fail(ErrorCode::NetworkError)),
        );
        server.set_transcript("note this down");

        let info = server.start_speech_processing(&AudioConfig::default()).await.unwrap();
        let mut stream = server.open_stream(&info.transcription_id, &info.sse_endpoint).await.unwrap();
        server.end_speech_processing(&info.transcription_id).await.unwrap();

        let mut closing = Vec::new();
        while let Some(frame) = stream.next().await {
            let event = TranscriptionEvent::from_frame(&frame).unwrap().unwrap();
            if event.is_closing() {
                closing.push(event);
            }
        }
        assert_eq!(closing.len(), 1);
        assert!(matches!(
            closing[0],
            TranscriptionEvent::Error { code: ErrorCode::NetworkError, .. }
        ));
    }

    #[tokio::test]
    async fn dropped_connection_emits_connection_lost() {
        let server = SimServer::reliable();
        server.connect("sim://local").await.unwrap();
        let mut events = server.subscribe();

        server.drop_connection();

        let event = events.recv().await.unwrap();
        assert_eq!(event.category, EventCategory::Error);
        assert!(event.payload.contains("connection_lost"));
        assert!(!server.is_connected().await.unwrap());
    }
}
