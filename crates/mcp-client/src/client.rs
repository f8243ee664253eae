//! The client context.
//!
//! `McpClient` owns one transport and the components built on it. There are
//! no globals: create one with [`McpClient::new`], call [`McpClient::init`]
//! (or just connect), and call [`McpClient::cleanup`] when done.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use mcp_protocol::{
    EndSpeechResult, EventCategory, McpEvent, ProtocolError, ResourceResponse, ServerInfo, ToolCallResponse,
    ToolParameters,
};
use mcp_transport::{McpTransport, TranscriptionBackend};
use tracing::info;

use crate::config::{ClientConfig, RetryConfigUpdate};
use crate::connection::{ConnectionManager, ConnectionPhase, ConnectionState};
use crate::events::{EventBus, Subscription};
use crate::rpc::RpcLayer;
use crate::session::{SessionManager, SessionState, TranscriptionSession};
use crate::tools::ToolHelpers;

pub struct McpClient<T: McpTransport + TranscriptionBackend> {
    transport: Arc<T>,
    config: ClientConfig,
    connection: Arc<ConnectionManager<T>>,
    rpc: RpcLayer<T>,
    bus: EventBus,
    sessions: SessionManager<T>,
    attached: AtomicBool,
}

impl<T: McpTransport + TranscriptionBackend> McpClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self::with_shared(Arc::new(transport), config)
    }

    pub fn with_shared(transport: Arc<T>, config: ClientConfig) -> Self {
        let connection = ConnectionManager::new(transport.clone(), config.retry, config.reconnect_delay());
        Self {
            rpc: RpcLayer::new(connection.clone()),
            sessions: SessionManager::new(transport.clone()),
            bus: EventBus::new(),
            attached: AtomicBool::new(false),
            transport,
            config,
            connection,
        }
    }

    /// Initialise the transport and start routing its push events. Safe to
    /// call more than once.
    pub async fn init(&self) -> Result<(), ProtocolError> {
        self.connection.initialize().await?;

        if !self.bus.is_closed() && !self.attached.swap(true, Ordering::AcqRel) {
            let connection = Arc::downgrade(&self.connection);
            self.bus.attach(self.transport.subscribe(), move |event| {
                if let Some(connection) = connection.upgrade() {
                    connection.handle_push_event(event);
                }
            });
        }
        Ok(())
    }

    /// Cancel the pending reconnect, stop live sessions, and close the
    /// event bus.
    pub async fn cleanup(&self) {
        self.connection.cancel_reconnect();
        self.sessions.shutdown().await;
        self.bus.cleanup();
        info!("MCP client cleaned up");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────

    /// Connect to the configured server.
    pub async fn connect(&self) -> Result<bool, ProtocolError> {
        let url = self.config.server_url.clone();
        self.connect_to(&url).await
    }

    pub async fn connect_to(&self, url: &str) -> Result<bool, ProtocolError> {
        self.init().await?;
        self.connection.connect(url).await
    }

    pub async fn disconnect(&self) -> Result<bool, ProtocolError> {
        self.connection.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    pub fn set_retry_config(&self, update: &RetryConfigUpdate) {
        self.connection.set_retry_config(update);
    }

    // ─────────────────────────────────────────────────────────────────────
    // RPC
    // ─────────────────────────────────────────────────────────────────────

    pub async fn call_tool(&self, name: &str, parameters: &ToolParameters) -> Result<ToolCallResponse, ProtocolError> {
        self.rpc.call_tool(name, parameters, true).await
    }

    pub async fn call_tool_with(
        &self,
        name: &str,
        parameters: &ToolParameters,
        retry: bool,
    ) -> Result<ToolCallResponse, ProtocolError> {
        self.rpc.call_tool(name, parameters, retry).await
    }

    pub async fn request_resource(&self, uri: &str) -> Result<ResourceResponse, ProtocolError> {
        self.rpc.request_resource(uri, true).await
    }

    pub async fn get_server_info(&self) -> Option<ServerInfo> {
        self.rpc.get_server_info().await
    }

    pub async fn list_tool_names(&self) -> Vec<String> {
        self.rpc.list_tool_names().await
    }

    pub async fn handle_input(&self, message: &str) -> Result<bool, ProtocolError> {
        self.rpc.handle_input(message).await
    }

    pub fn tools(&self) -> ToolHelpers<'_, T> {
        ToolHelpers::new(&self.rpc)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    pub fn subscribe<F>(&self, category: EventCategory, handler: F) -> Subscription
    where
        F: Fn(&McpEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(category, handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transcription
    // ─────────────────────────────────────────────────────────────────────

    /// Start a transcription session with the configured audio parameters.
    /// Requires a connection.
    pub async fn start_session(&self) -> Result<TranscriptionSession, ProtocolError> {
        self.connection.ensure_connected()?;
        self.sessions.start_session(&self.config.audio).await
    }

    pub async fn send_chunk(&self, id: &str, chunk: Bytes) -> Result<bool, ProtocolError> {
        self.sessions.send_chunk(id, chunk).await
    }

    pub async fn end_session(&self, id: &str) -> Result<EndSpeechResult, ProtocolError> {
        self.sessions.end_session(id).await
    }

    pub async fn stop_session(&self, id: &str) -> bool {
        self.sessions.stop_session(id).await
    }

    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        self.sessions.session_state(id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use mcp_protocol::{ConnectionStateEvent, ErrorCode};
    use mcp_sim::SimServer;

    use super::*;

    #[tokio::test]
    async fn connect_routes_state_events_to_subscribers() {
        let server = SimServer::reliable();
        let client = McpClient::with_shared(Arc::new(server.clone()), ClientConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _sub = client.subscribe(EventCategory::ConnectionState, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert!(client.connect().await.unwrap());
        server.emit(&McpEvent::ConnectionState(ConnectionStateEvent {
            connected: true,
            server_name: Some("renamed".into()),
        }));
        for _ in 0..10 {
            if seen.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(client.connection_state().server_name.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn sessions_need_a_connection() {
        let client = McpClient::new(SimServer::reliable(), ClientConfig::default());
        let err = client.start_session().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConnected);
    }

    #[tokio::test]
    async fn init_attaches_once_and_cleanup_detaches() {
        let server = SimServer::reliable();
        let client = McpClient::with_shared(Arc::new(server.clone()), ClientConfig::default());

        client.init().await.unwrap();
        client.init().await.unwrap();
        assert_eq!(server.subscriber_count(), 1);

        client.cleanup().await;
        for _ in 0..10 {
            if server.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.subscriber_count(), 0);
        assert_eq!(client.events().listener_count(), 0);
    }
}
