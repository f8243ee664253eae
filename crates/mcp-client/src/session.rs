//! Transcription sessions.
//!
//! Each session owns a pump task that reads its push stream and delivers
//! typed events to the caller's handle. The pump is the only writer of the
//! session state after start, so every state change and the single closing
//! event come from one place. Requests from the manager (`end`, chunk
//! failure, `stop`) reach the pump over a control channel and are handled
//! after any frames already buffered on the stream.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use mcp_protocol::{AudioConfig, EndSpeechResult, ErrorCode, ProtocolError, StreamFrame, TranscriptionEvent};
use mcp_transport::{PushStream, TranscriptionBackend};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::normalize::normalize;

const CONTROL_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Streaming => 1,
            Self::Completed | Self::Failed | Self::Stopped => 2,
        }
    }

    /// Move forward to `next`. Backward and sideways moves are refused.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct SessionShared {
    state: SessionState,
    /// The closing event, once delivered
    closing: Option<TranscriptionEvent>,
}

enum Control {
    Finalize {
        outcome: Result<EndSpeechResult, ProtocolError>,
        done: oneshot::Sender<()>,
    },
    Fail {
        error: ProtocolError,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct Entry {
    shared: Arc<Mutex<SessionShared>>,
    control: mpsc::Sender<Control>,
}

impl Entry {
    fn state(&self) -> SessionState {
        self.shared.lock().state
    }
}

/// Caller-side handle of a running session.
#[derive(Debug)]
pub struct TranscriptionSession {
    id: String,
    endpoint: String,
    events: mpsc::UnboundedReceiver<TranscriptionEvent>,
    shared: Arc<Mutex<SessionShared>>,
}

impl TranscriptionSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream endpoint announced by the server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Next event, or `None` once the session has closed and every event
    /// was read.
    pub async fn next_event(&mut self) -> Option<TranscriptionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<TranscriptionEvent> {
        self.events.try_recv().ok()
    }
}

pub struct SessionManager<B: TranscriptionBackend> {
    backend: Arc<B>,
    sessions: Arc<DashMap<String, Entry>>,
}

impl<B: TranscriptionBackend> SessionManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// State of a registered session. Sessions leave the registry when they
    /// reach a terminal state.
    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|e| e.state())
    }

    fn streaming_entry(&self, id: &str) -> Result<Entry, ProtocolError> {
        match self.sessions.get(id).map(|e| e.value().clone()) {
            Some(entry) if entry.state() == SessionState::Streaming => Ok(entry),
            _ => Err(ProtocolError::session_not_active(id)),
        }
    }

    /// Open a session and start streaming its events.
    pub async fn start_session(&self, config: &AudioConfig) -> Result<TranscriptionSession, ProtocolError> {
        let info = self
            .backend
            .start_speech_processing(config)
            .await
            .map_err(|e| normalize(&e, ErrorCode::TranscriptionFailed))?;
        let id = info.transcription_id;

        let mut stream = match self.backend.open_stream(&id, &info.sse_endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = normalize(&e, ErrorCode::TranscriptionFailed);
                warn!("Stream for session {id} did not open: {error}");
                // Best effort: release the session the server already opened.
                if let Err(e) = self.backend.end_speech_processing(&id).await {
                    debug!("Closing session {id} failed: {e}");
                }
                return Err(error);
            }
        };

        let mut state = SessionState::Idle;
        state.advance(SessionState::Streaming);
        let shared = Arc::new(Mutex::new(SessionShared { state, closing: None }));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        match self.sessions.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                stream.close();
                return Err(ProtocolError::new(
                    ErrorCode::TranscriptionFailed,
                    format!("Server reused transcription id {id}"),
                ));
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    shared: shared.clone(),
                    control: control_tx,
                });
            }
        }

        tokio::spawn(pump(
            id.clone(),
            stream,
            control_rx,
            shared.clone(),
            events_tx,
            self.sessions.clone(),
        ));

        info!("Transcription session {id} started");
        Ok(TranscriptionSession {
            id,
            endpoint: info.sse_endpoint,
            events: events_rx,
            shared,
        })
    }

    /// Send audio. A transport failure ends the session with an `Error`
    /// event and is returned to the caller.
    pub async fn send_chunk(&self, id: &str, chunk: Bytes) -> Result<bool, ProtocolError> {
        let entry = self.streaming_entry(id)?;
        let size = chunk.len();

        match self.backend.send_audio_chunk(id, chunk).await {
            Ok(receipt) => {
                debug!("Sent {size} bytes to session {id}");
                Ok(receipt.received)
            }
            Err(e) => {
                let error = normalize(&e, ErrorCode::TranscriptionFailed);
                warn!("Audio chunk for session {id} failed: {error}");
                let (done, ack) = oneshot::channel();
                if entry.control.send(Control::Fail { error: error.clone(), done }).await.is_ok() {
                    let _ = ack.await;
                }
                self.remove(id, &entry);
                Err(error)
            }
        }
    }

    /// Finalise a session and return the server's result.
    ///
    /// Events already buffered on the stream are delivered first. If the
    /// stream closed the session on its own, that outcome wins over the
    /// backend's answer.
    pub async fn end_session(&self, id: &str) -> Result<EndSpeechResult, ProtocolError> {
        let entry = self.streaming_entry(id)?;
        let _unregister = Unregister {
            sessions: &self.sessions,
            id,
            entry: &entry,
        };

        let outcome = self
            .backend
            .end_speech_processing(id)
            .await
            .map_err(|e| normalize(&e, ErrorCode::TranscriptionFailed));

        let (done, ack) = oneshot::channel();
        let finalize = Control::Finalize {
            outcome: outcome.clone(),
            done,
        };
        if entry.control.send(finalize).await.is_ok() {
            let _ = ack.await;
        }

        let closing = entry.shared.lock().closing.clone();
        let result = match closing {
            Some(TranscriptionEvent::Error { code, message }) => Err(ProtocolError::new(code, message)),
            Some(TranscriptionEvent::Complete { text, confidence, .. }) => match outcome {
                Ok(result) if result.success => Ok(result),
                _ => Ok(EndSpeechResult {
                    success: true,
                    transcription: text,
                    confidence: Some(confidence),
                    target_system: None,
                    operation: None,
                    details: None,
                    error: None,
                }),
            },
            _ => settle(outcome),
        };

        match &result {
            Ok(r) => info!("Transcription session {id} ended: \"{}\"", r.transcription),
            Err(e) => warn!("Transcription session {id} failed: {e}"),
        }
        result
    }

    /// Stop a session from the client side. Returns `false` if it was not
    /// registered.
    pub async fn stop_session(&self, id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return false;
        };
        let (done, ack) = oneshot::channel();
        if entry.control.send(Control::Stop { done }).await.is_ok() {
            let _ = ack.await;
        }
        info!("Transcription session {id} stopped");
        true
    }

    /// Stop every live session.
    pub async fn shutdown(&self) {
        let ids = self.session_ids();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            self.stop_session(id).await;
        }
        info!("Stopped {} transcription sessions", ids.len());
    }

    fn remove(&self, id: &str, entry: &Entry) {
        unregister(&self.sessions, id, entry);
    }
}

fn unregister(sessions: &DashMap<String, Entry>, id: &str, entry: &Entry) {
    sessions.remove_if(id, |_, current| Arc::ptr_eq(&current.shared, &entry.shared));
}

/// Removes a session from the registry on every exit path of `end_session`.
struct Unregister<'a> {
    sessions: &'a DashMap<String, Entry>,
    id: &'a str,
    entry: &'a Entry,
}

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        unregister(self.sessions, self.id, self.entry);
    }
}

fn settle(outcome: Result<EndSpeechResult, ProtocolError>) -> Result<EndSpeechResult, ProtocolError> {
    match outcome {
        Ok(result) if result.success => Ok(result),
        Ok(result) => Err(ProtocolError::new(
            ErrorCode::TranscriptionFailed,
            result.error.unwrap_or_default(),
        )),
        Err(e) => Err(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pump
// ─────────────────────────────────────────────────────────────────────────────

async fn pump(
    id: String,
    mut stream: PushStream,
    mut control: mpsc::Receiver<Control>,
    shared: Arc<Mutex<SessionShared>>,
    events: mpsc::UnboundedSender<TranscriptionEvent>,
    sessions: Arc<DashMap<String, Entry>>,
) {
    let mut stream_open = true;

    loop {
        tokio::select! {
            biased;

            frame = stream.next(), if stream_open => match frame {
                Some(frame) => {
                    let Some(event) = decode(&id, &frame) else { continue };
                    let closing = event.is_closing();
                    deliver(&shared, &events, event);
                    if closing {
                        break;
                    }
                }
                None => {
                    debug!("Stream for session {id} ended");
                    stream_open = false;
                }
            },

            command = control.recv() => match command {
                Some(Control::Finalize { outcome, done }) => {
                    deliver(&shared, &events, final_event(&id, &outcome));
                    let _ = done.send(());
                    break;
                }
                Some(Control::Fail { error, done }) => {
                    deliver(&shared, &events, TranscriptionEvent::Error {
                        code: error.code,
                        message: error.message,
                    });
                    let _ = done.send(());
                    break;
                }
                Some(Control::Stop { done }) => {
                    deliver(&shared, &events, TranscriptionEvent::Stop { transcription_id: id.clone() });
                    let _ = done.send(());
                    break;
                }
                None => {
                    // Unregistered without a request, e.g. a cancelled end.
                    deliver(&shared, &events, TranscriptionEvent::Stop { transcription_id: id.clone() });
                    break;
                }
            },
        }
    }

    stream.close();
    sessions.remove_if(&id, |_, entry| Arc::ptr_eq(&entry.shared, &shared));
    debug!("Session {id} pump finished");
}

fn decode(id: &str, frame: &StreamFrame) -> Option<TranscriptionEvent> {
    match TranscriptionEvent::from_frame(frame) {
        Ok(Some(event)) => Some(event),
        Ok(None) => {
            debug!("Session {id}: ignoring '{}' stream event", frame.event);
            None
        }
        // A server fault must still close the session.
        Err(e) if frame.event == StreamFrame::ERROR => {
            warn!("Session {id}: {e}");
            Some(TranscriptionEvent::Error {
                code: e.code,
                message: e.message,
            })
        }
        Err(e) => {
            warn!("Session {id}: {e}");
            None
        }
    }
}

/// Record and forward an event. Nothing is delivered after the closing event.
fn deliver(
    shared: &Mutex<SessionShared>,
    events: &mpsc::UnboundedSender<TranscriptionEvent>,
    event: TranscriptionEvent,
) {
    {
        let mut shared = shared.lock();
        if shared.state.is_terminal() {
            return;
        }
        let next = match &event {
            TranscriptionEvent::Partial { .. } => None,
            TranscriptionEvent::Complete { .. } => Some(SessionState::Completed),
            TranscriptionEvent::Error { .. } => Some(SessionState::Failed),
            TranscriptionEvent::Stop { .. } => Some(SessionState::Stopped),
        };
        if let Some(next) = next {
            shared.state.advance(next);
            shared.closing = Some(event.clone());
        }
    }
    let _ = events.send(event);
}

fn final_event(id: &str, outcome: &Result<EndSpeechResult, ProtocolError>) -> TranscriptionEvent {
    match outcome {
        Ok(result) if result.success => TranscriptionEvent::Complete {
            transcription_id: id.to_string(),
            text: result.transcription.clone(),
            confidence: result.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
        },
        Ok(result) => {
            let error = ProtocolError::new(ErrorCode::TranscriptionFailed, result.error.clone().unwrap_or_default());
            TranscriptionEvent::Error {
                code: error.code,
                message: error.message,
            }
        }
        Err(e) => TranscriptionEvent::Error {
            code: e.code,
            message: e.message.clone(),
        },
    }
}
