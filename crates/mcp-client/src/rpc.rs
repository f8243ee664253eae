//! Tool and resource calls over the current connection.
//!
//! Each call snapshots the retry policy, checks the connection before every
//! attempt, normalizes transport failures, and validates the response shape.

use std::sync::Arc;

use mcp_protocol::{ErrorCode, ProtocolError, ResourceResponse, ServerInfo, ToolCallResponse, ToolParameters};
use mcp_transport::McpTransport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::connection::ConnectionManager;
use crate::normalize::normalize;
use crate::retry::{is_retryable, with_retry};

pub struct RpcLayer<T: McpTransport> {
    connection: Arc<ConnectionManager<T>>,
}

impl<T: McpTransport> RpcLayer<T> {
    pub fn new(connection: Arc<ConnectionManager<T>>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    fn policy(&self, retry: bool) -> RetryConfig {
        if retry {
            self.connection.retry_config()
        } else {
            RetryConfig::no_retry()
        }
    }

    /// Invoke a tool.
    ///
    /// Fails with `not_connected` before any transport call when the client
    /// is disconnected. A response carrying an error content block is a
    /// `tool_call_failed`.
    pub async fn call_tool(
        &self,
        name: &str,
        parameters: &ToolParameters,
        retry: bool,
    ) -> Result<ToolCallResponse, ProtocolError> {
        let policy = self.policy(retry);
        let params_json = serde_json::to_string(parameters)
            .map_err(|e| ProtocolError::new(ErrorCode::ValidationError, e.to_string()))?;
        debug!("Calling tool {name}");

        let transport = self.connection.transport();
        let raw = with_retry(
            || async {
                self.connection.ensure_connected()?;
                transport
                    .call_tool(name, &params_json)
                    .await
                    .map_err(|e| normalize(&e, ErrorCode::ToolCallFailed))
            },
            &policy,
            is_retryable,
        )
        .await?;

        let response: ToolCallResponse = parse_response(&raw, "tool response", ErrorCode::ToolCallFailed)?;
        if let Some(item) = response.error_item() {
            let message = item.text.clone().unwrap_or_default();
            warn!("Tool {name} reported an error: {message}");
            return Err(ProtocolError::new(ErrorCode::ToolCallFailed, message));
        }
        Ok(response)
    }

    /// Read a resource by URI.
    pub async fn request_resource(&self, uri: &str, retry: bool) -> Result<ResourceResponse, ProtocolError> {
        let policy = self.policy(retry);
        debug!("Requesting resource {uri}");

        let transport = self.connection.transport();
        let raw = with_retry(
            || async {
                self.connection.ensure_connected()?;
                transport
                    .request_resource(uri)
                    .await
                    .map_err(|e| normalize(&e, ErrorCode::ResourceRequestFailed))
            },
            &policy,
            is_retryable,
        )
        .await?;

        parse_response(&raw, "resource response", ErrorCode::ResourceRequestFailed)
    }

    /// Server metadata, from cache when available. Never fails.
    pub async fn get_server_info(&self) -> Option<ServerInfo> {
        if let Some(info) = self.connection.cached_server_info() {
            return Some(info);
        }
        self.connection.refresh_server_info().await
    }

    /// Names of the tools the server advertises.
    pub async fn list_tool_names(&self) -> Vec<String> {
        self.get_server_info()
            .await
            .map(|info| info.tool_names())
            .unwrap_or_default()
    }

    /// Forward a raw protocol message. Not retried.
    pub async fn handle_input(&self, message: &str) -> Result<bool, ProtocolError> {
        self.connection.ensure_connected()?;
        self.connection
            .transport()
            .handle_input(message)
            .await
            .map_err(|e| {
                let err = normalize(&e, ErrorCode::InputHandlingFailed);
                ProtocolError::new(ErrorCode::InputHandlingFailed, err.message)
            })
    }
}

/// Decode a JSON response. A top-level non-null `error` member is reported
/// as a failure, with its code when it carries a recognised one.
fn parse_response<R: DeserializeOwned>(raw: &str, what: &str, default: ErrorCode) -> Result<R, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::malformed(what, e))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(embedded_error(error, default));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::malformed(what, e))
}

fn embedded_error(error: &Value, default: ErrorCode) -> ProtocolError {
    match error {
        Value::String(message) => ProtocolError::new(default, message.clone()),
        Value::Object(fields) => {
            let message = fields.get("message").and_then(Value::as_str).unwrap_or_default();
            let code = match fields.get("code") {
                Some(Value::String(code)) => ErrorCode::from_wire(code),
                Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()).and_then(ErrorCode::from_status),
                _ => None,
            };
            ProtocolError::new(code.unwrap_or(default), message)
        }
        other => ProtocolError::new(default, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mcp_sim::{Fault, Operation, ScriptedFaults, SimServer};
    use serde_json::json;

    use super::*;

    fn params(value: Value) -> ToolParameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("parameters must be an object"),
        }
    }

    async fn connected(server: &SimServer) -> RpcLayer<SimServer> {
        let retry = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
        };
        let connection = ConnectionManager::new(Arc::new(server.clone()), retry, Duration::from_secs(5));
        connection.connect("sim://local").await.unwrap();
        RpcLayer::new(connection)
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_succeeds() {
        let server = SimServer::reliable();
        let rpc = connected(&server).await;

        let response = rpc
            .call_tool("createReminder", &params(json!({"title": "Buy milk"})), true)
            .await
            .unwrap();

        assert_eq!(response.joined_text(), "Created reminder \"Buy milk\"");
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_retries_transient_failures() {
        let server = SimServer::new(
            ScriptedFaults::new().fail_times(Operation::CallTool, Fault::ServerOverload, 2),
        );
        let rpc = connected(&server).await;

        rpc.call_tool("createReminder", &params(json!({"title": "x"})), true)
            .await
            .unwrap();

        assert_eq!(server.rpc_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_without_retry_fails_fast() {
        let server = SimServer::new(ScriptedFaults::new().fail(Operation::CallTool, Fault::Network));
        let rpc = connected(&server).await;

        let err = rpc
            .call_tool("createReminder", &params(json!({"title": "x"})), false)
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(server.rpc_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_are_not_retried() {
        let server = SimServer::reliable();
        let rpc = connected(&server).await;

        let err = rpc
            .call_tool("createCalendarEvent", &params(json!({"title": "Standup"})), true)
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(server.rpc_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_content_block_is_a_tool_failure() {
        let server = SimServer::reliable();
        let rpc = connected(&server).await;

        let err = rpc.call_tool("noSuchTool", &ToolParameters::new(), true).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolCallFailed);
        assert!(err.message.contains("noSuchTool"));
    }

    #[tokio::test]
    async fn disconnected_calls_never_reach_the_transport() {
        let server = SimServer::reliable();
        let connection = ConnectionManager::new(Arc::new(server.clone()), RetryConfig::default(), Duration::from_secs(5));
        let rpc = RpcLayer::new(connection);

        let err = rpc.call_tool("createNote", &ToolParameters::new(), true).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConnected);
        let err = rpc.request_resource("notes://welcome", true).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConnected);
        let err = rpc.handle_input("{}").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConnected);

        assert_eq!(server.rpc_calls(), 0);
        assert!(rpc.get_server_info().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resource_lookup_and_not_found() {
        let server = SimServer::reliable();
        server.add_resource("notes://todo", "ship it");
        let rpc = connected(&server).await;

        let response = rpc.request_resource("notes://todo", true).await.unwrap();
        assert_eq!(response.contents[0].text, "ship it");

        let err = rpc.request_resource("notes://missing", true).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn server_info_is_cached_after_connect() {
        let server = SimServer::reliable();
        let rpc = connected(&server).await;

        let names = rpc.list_tool_names().await;
        assert!(names.iter().any(|n| n == "createReminder"));
        assert_eq!(rpc.get_server_info().await.unwrap().name, server.name());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_input_failure_is_input_handling_failed() {
        let server = SimServer::new(ScriptedFaults::new().fail(Operation::HandleInput, Fault::Network));
        let rpc = connected(&server).await;

        let err = rpc.handle_input(r#"{"jsonrpc":"2.0"}"#).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InputHandlingFailed);
        assert!(rpc.handle_input(r#"{"jsonrpc":"2.0"}"#).await.unwrap());
    }

    #[test]
    fn embedded_errors_keep_recognised_codes() {
        let err = parse_response::<ToolCallResponse>(
            r#"{"error":{"code":"rate_limit_exceeded","message":"slow"}}"#,
            "tool response",
            ErrorCode::ToolCallFailed,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);

        let err = parse_response::<ToolCallResponse>(
            r#"{"error":{"code":503}}"#,
            "tool response",
            ErrorCode::ToolCallFailed,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerError);

        let err = parse_response::<ToolCallResponse>(r#"{"error":"boom"}"#, "tool response", ErrorCode::ToolCallFailed)
            .unwrap_err();
        assert_eq!((err.code, err.message.as_str()), (ErrorCode::ToolCallFailed, "boom"));
    }

    #[test]
    fn null_error_and_garbage() {
        let ok = parse_response::<ToolCallResponse>(
            r#"{"content":[{"type":"text","text":"hi"}],"error":null}"#,
            "tool response",
            ErrorCode::ToolCallFailed,
        )
        .unwrap();
        assert_eq!(ok.joined_text(), "hi");

        let err = parse_response::<ToolCallResponse>("<html>", "tool response", ErrorCode::ToolCallFailed).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedPayload);
    }
}
