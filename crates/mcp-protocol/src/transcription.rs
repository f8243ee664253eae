//! Speech transcription wire types: session setup, audio chunks, and the
//! events pushed over a session's stream endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};

/// Audio parameters announced when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub format: String,
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            format: "pcm_s16le".into(),
            sample_rate: 16_000,
        }
    }
}

/// Result of `speech/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechSessionInfo {
    pub transcription_id: String,
    pub sse_endpoint: String,
}

/// Result of `speech/chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub received: bool,
}

/// Result of `speech/end`: the final transcription plus what the server did
/// with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSpeechResult {
    pub success: bool,
    #[serde(default)]
    pub transcription: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream frames
// ─────────────────────────────────────────────────────────────────────────────

/// One raw event read from a session stream: an event name and its JSON data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

impl StreamFrame {
    pub const TRANSCRIPTION: &str = "transcription";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";
    pub const STOP: &str = "stop";

    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Encode a typed event back into a frame.
    pub fn from_event(event: &TranscriptionEvent) -> Self {
        match event {
            TranscriptionEvent::Partial { text, confidence, is_final } => Self::new(
                Self::TRANSCRIPTION,
                serde_json::json!({ "text": text, "confidence": confidence, "isFinal": is_final })
                    .to_string(),
            ),
            TranscriptionEvent::Complete { transcription_id, text, confidence } => Self::new(
                Self::COMPLETE,
                serde_json::json!({
                    "transcriptionId": transcription_id,
                    "text": text,
                    "confidence": confidence,
                })
                .to_string(),
            ),
            TranscriptionEvent::Error { code, message } => Self::new(
                Self::ERROR,
                serde_json::json!({ "code": code.as_str(), "message": message }).to_string(),
            ),
            TranscriptionEvent::Stop { transcription_id } => Self::new(
                Self::STOP,
                serde_json::json!({ "transcriptionId": transcription_id }).to_string(),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialPayload {
    text: String,
    confidence: f32,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletePayload {
    transcription_id: String,
    text: String,
    confidence: f32,
}

/// Servers send `code` as a taxonomy name or a numeric status, and may omit
/// either field.
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorPayload {
    fn into_protocol_error(self) -> ProtocolError {
        let code = match self.code {
            Some(Value::String(code)) => code,
            Some(Value::Number(status)) => status.to_string(),
            _ => String::new(),
        };
        ProtocolError::from_wire(&code, self.message.unwrap_or_default(), ErrorCode::TranscriptionFailed)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopPayload {
    transcription_id: String,
}

/// A typed transcription event as delivered to session owners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TranscriptionEvent {
    #[serde(rename_all = "camelCase")]
    Partial { text: String, confidence: f32, is_final: bool },
    #[serde(rename_all = "camelCase")]
    Complete { transcription_id: String, text: String, confidence: f32 },
    Error { code: ErrorCode, message: String },
    #[serde(rename_all = "camelCase")]
    Stop { transcription_id: String },
}

impl TranscriptionEvent {
    /// Decode a stream frame. Confidence values are clamped into `[0, 1]`.
    ///
    /// Unknown event names yield `Ok(None)` so that servers can add event
    /// types without breaking older clients.
    pub fn from_frame(frame: &StreamFrame) -> Result<Option<Self>, ProtocolError> {
        let malformed = |e: serde_json::Error| {
            ProtocolError::malformed(&format!("'{}' stream event", frame.event), e)
        };
        let event = match frame.event.as_str() {
            StreamFrame::TRANSCRIPTION => {
                let p: PartialPayload = serde_json::from_str(&frame.data).map_err(malformed)?;
                Self::Partial {
                    text: p.text,
                    confidence: clamp_confidence(p.confidence),
                    is_final: p.is_final,
                }
            }
            StreamFrame::COMPLETE => {
                let p: CompletePayload = serde_json::from_str(&frame.data).map_err(malformed)?;
                Self::Complete {
                    transcription_id: p.transcription_id,
                    text: p.text,
                    confidence: clamp_confidence(p.confidence),
                }
            }
            StreamFrame::ERROR => {
                let e: ErrorPayload = serde_json::from_str(&frame.data).map_err(malformed)?;
                let err = e.into_protocol_error();
                Self::Error { code: err.code, message: err.message }
            }
            StreamFrame::STOP => {
                let p: StopPayload = serde_json::from_str(&frame.data).map_err(malformed)?;
                Self::Stop { transcription_id: p.transcription_id }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// `Complete`, `Error`, and `Stop` close a session.
    pub fn is_closing(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}
