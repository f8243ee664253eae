//! Native transport failures.
//!
//! These never cross the RPC layer: the client normalizes every
//! [`TransportError`] into a `ProtocolError` with a stable code.

/// A failure reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link to the server is down or could not be established.
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// An HTTP-style status reported by the server.
    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// A `{code, message}` failure. The code may be a taxonomy name, a bare
    /// status such as `"503"`, or something the client does not recognise.
    #[error("[{code}] {message}")]
    Coded { code: String, message: String },

    /// A payload from the server did not have the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Coded {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// The message carried by the error, without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::Network(m) | Self::Timeout(m) | Self::Malformed(m) | Self::Other(m) => m.clone(),
            Self::Status { message, .. } | Self::Coded { message, .. } => message.clone(),
            Self::WebSocket(e) => e.to_string(),
            Self::Http(e) => e.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
