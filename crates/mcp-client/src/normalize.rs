//! Transport failure normalization.
//!
//! Maps every [`TransportError`] to a [`ProtocolError`] with a stable code.
//! `default` is the operation's own code (`tool_call_failed`, ...), used
//! when the failure does not classify.

use mcp_protocol::{ErrorCode, ProtocolError};
use mcp_transport::TransportError;

pub fn normalize(err: &TransportError, default: ErrorCode) -> ProtocolError {
    let code = classify(err).unwrap_or(default);
    ProtocolError::new(code, err.detail())
}

fn classify(err: &TransportError) -> Option<ErrorCode> {
    match err {
        TransportError::Network(_) | TransportError::WebSocket(_) => Some(ErrorCode::NetworkError),
        TransportError::Timeout(_) => Some(ErrorCode::TimeoutError),
        TransportError::Status { status, .. } => ErrorCode::from_status(*status),
        TransportError::Coded { code, .. } => ErrorCode::from_wire(code),
        TransportError::Malformed(_) => Some(ErrorCode::MalformedPayload),
        TransportError::Http(e) => {
            if e.is_timeout() {
                Some(ErrorCode::TimeoutError)
            } else if let Some(status) = e.status() {
                ErrorCode::from_status(status.as_u16())
            } else if e.is_connect() || e.is_request() || e.is_body() {
                Some(ErrorCode::NetworkError)
            } else {
                None
            }
        }
        TransportError::Other(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_failures_are_network_errors() {
        let err = normalize(&TransportError::Network("reset".into()), ErrorCode::ToolCallFailed);
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(err.message, "reset");
    }

    #[test]
    fn statuses_classify() {
        let cases = [
            (503, ErrorCode::ServerError),
            (500, ErrorCode::ServerError),
            (401, ErrorCode::AuthenticationError),
            (403, ErrorCode::AuthenticationError),
            (404, ErrorCode::ResourceNotFound),
            (429, ErrorCode::RateLimitExceeded),
            (400, ErrorCode::ValidationError),
            (422, ErrorCode::ValidationError),
        ];
        for (status, expected) in cases {
            let err = normalize(&TransportError::status(status, "x"), ErrorCode::ToolCallFailed);
            assert_eq!(err.code, expected, "status {status}");
        }
    }

    #[test]
    fn coded_errors_keep_recognised_codes() {
        let err = normalize(
            &TransportError::coded("rate_limit_exceeded", "slow down"),
            ErrorCode::ResourceRequestFailed,
        );
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);

        let err = normalize(&TransportError::coded("503", "busy"), ErrorCode::ResourceRequestFailed);
        assert_eq!(err.code, ErrorCode::ServerError);
    }

    #[test]
    fn unknown_failures_use_operation_default() {
        let err = normalize(&TransportError::coded("E_WEIRD", "odd"), ErrorCode::ToolCallFailed);
        assert_eq!(err.code, ErrorCode::ToolCallFailed);
        assert_eq!(err.message, "odd");

        let err = normalize(&TransportError::Other(String::new()), ErrorCode::DisconnectFailed);
        assert_eq!(err.code, ErrorCode::DisconnectFailed);
        assert_eq!(err.message, ErrorCode::DisconnectFailed.default_message());
    }

    #[test]
    fn malformed_payloads() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = normalize(&TransportError::from(json_err), ErrorCode::ToolCallFailed);
        assert_eq!(err.code, ErrorCode::MalformedPayload);
    }
}
