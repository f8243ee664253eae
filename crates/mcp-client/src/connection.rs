//! Connection lifecycle.
//!
//! `Disconnected → Connecting → Connected`, and `Connected → Reconnecting`
//! when the transport reports the link lost. At most one connect runs at a
//! time: the whole attempt (retries included) lives in a single shared
//! future that concurrent callers join.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use mcp_protocol::{ErrorCode, McpEvent, ProtocolError, ServerInfo};
use mcp_transport::McpTransport;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, RetryConfigUpdate};
use crate::normalize::normalize;
use crate::retry::{is_retryable, with_retry};

type SharedConnect = Shared<BoxFuture<'static, Result<bool, ProtocolError>>>;

/// What the client believes about the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped and a reconnect is scheduled.
    Reconnecting,
}

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    phase: ConnectionPhase,
    last_url: Option<String>,
    manual_disconnect: bool,
}

pub struct ConnectionManager<T: McpTransport> {
    transport: Arc<T>,
    status: Mutex<Status>,
    retry: RwLock<RetryConfig>,
    reconnect_delay: Duration,
    initialized: OnceCell<()>,
    /// The connect in flight, tagged with its generation
    in_flight: Mutex<Option<(u64, SharedConnect)>>,
    next_generation: AtomicU64,
    /// Bumped by every manual disconnect; a pending reconnect compares it
    disconnect_epoch: AtomicU64,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    server_info: RwLock<Option<ServerInfo>>,
}

impl<T: McpTransport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, retry: RetryConfig, reconnect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            status: Mutex::new(Status::default()),
            retry: RwLock::new(retry),
            reconnect_delay,
            initialized: OnceCell::new(),
            in_flight: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            disconnect_epoch: AtomicU64::new(0),
            reconnect: Mutex::new(None),
            server_info: RwLock::new(None),
        })
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.status.lock().phase
    }

    /// Endpoint of the last successful connect.
    pub fn last_url(&self) -> Option<String> {
        self.status.lock().last_url.clone()
    }

    /// Local view of the link, without asking the transport.
    pub fn is_connected_cached(&self) -> bool {
        self.status.lock().state.connected
    }

    pub fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.is_connected_cached() {
            Ok(())
        } else {
            Err(ProtocolError::not_connected())
        }
    }

    /// Snapshot of the retry policy; in-flight calls keep the one they took.
    pub fn retry_config(&self) -> RetryConfig {
        *self.retry.read()
    }

    pub fn set_retry_config(&self, update: &RetryConfigUpdate) {
        let mut retry = self.retry.write();
        retry.apply(update);
        debug!("Retry config updated: {:?}", *retry);
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// One-time transport initialisation. Later calls return immediately.
    pub async fn initialize(&self) -> Result<(), ProtocolError> {
        self.initialized
            .get_or_try_init(|| async {
                match self.transport.initialize().await {
                    Ok(true) => {
                        debug!("Transport initialized");
                        Ok(())
                    }
                    Ok(false) => Err(ProtocolError::new(
                        ErrorCode::InitializationFailed,
                        "Transport reported it is unavailable",
                    )),
                    Err(e) => Err(normalize(&e, ErrorCode::InitializationFailed)),
                }
            })
            .await
            .map(|_| ())
    }

    /// Connect with the current retry policy.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<bool, ProtocolError> {
        let retry = self.retry_config();
        self.connect_with(url, retry).await
    }

    /// Connect, or join the connect already in flight.
    ///
    /// A caller that joins gets the pending attempt's result even if it asked
    /// for a different `url`.
    pub async fn connect_with(self: &Arc<Self>, url: &str, retry: RetryConfig) -> Result<bool, ProtocolError> {
        let pending = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some((_, pending)) => {
                    debug!("Connect already in flight, joining it");
                    pending.clone()
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let this = self.clone();
                    let url = url.to_string();
                    let pending = async move { this.run_connect(generation, url, retry).await }
                        .boxed()
                        .shared();
                    *slot = Some((generation, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_connect(&self, generation: u64, url: String, retry: RetryConfig) -> Result<bool, ProtocolError> {
        let result = self.attempt_connect(&url, &retry).await;

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
            *slot = None;
        }
        result
    }

    async fn attempt_connect(&self, url: &str, retry: &RetryConfig) -> Result<bool, ProtocolError> {
        let epoch = self.disconnect_epoch.load(Ordering::Acquire);
        self.status.lock().phase = ConnectionPhase::Connecting;
        info!("Connecting to {url}");

        if let Err(e) = self.initialize().await {
            self.mark_disconnected();
            return Err(e);
        }

        let outcome = with_retry(
            || async {
                self.transport
                    .connect(url)
                    .await
                    .map_err(|e| normalize(&e, ErrorCode::ConnectionFailed))
            },
            retry,
            is_retryable,
        )
        .await;

        match outcome {
            Ok(true) => {
                let superseded = {
                    let mut status = self.status.lock();
                    if self.disconnect_epoch.load(Ordering::Acquire) != epoch {
                        true
                    } else {
                        status.state.connected = true;
                        status.phase = ConnectionPhase::Connected;
                        status.last_url = Some(url.to_string());
                        status.manual_disconnect = false;
                        false
                    }
                };
                if superseded {
                    warn!("Connect to {url} finished after a manual disconnect, closing it");
                    if let Err(e) = self.transport.disconnect().await {
                        debug!("Closing superseded link failed: {e}");
                    }
                    self.mark_disconnected();
                    return Ok(false);
                }
                info!("Connected to {url}");
                if let Some(info) = self.refresh_server_info().await {
                    let mut status = self.status.lock();
                    if status.state.connected {
                        status.state.server_name = Some(info.name);
                    }
                }
                Ok(true)
            }
            Ok(false) => {
                warn!("Server at {url} declined the connection");
                self.mark_disconnected();
                Ok(false)
            }
            Err(e) => {
                self.mark_disconnected();
                if e.is_retryable() {
                    error!("Connecting to {url} failed after {} retries: {e}", retry.max_retries);
                    Err(ProtocolError::new(
                        ErrorCode::ConnectionFailed,
                        format!("Could not connect to {url}: {}", e.message),
                    ))
                } else {
                    error!("Connecting to {url} failed: {e}");
                    Err(e)
                }
            }
        }
    }

    /// Disconnect on purpose. Cancels any pending reconnect and releases the
    /// connect slot, so an attempt still running cannot complete the link.
    /// Local state is reset even if the transport fails or the call is
    /// cancelled.
    pub async fn disconnect(&self) -> Result<bool, ProtocolError> {
        {
            let mut status = self.status.lock();
            self.disconnect_epoch.fetch_add(1, Ordering::AcqRel);
            status.manual_disconnect = true;
        }
        if self.in_flight.lock().take().is_some() {
            debug!("Connect in flight abandoned");
        }
        self.cancel_reconnect();

        let _reset = ResetOnDrop(self);
        match self.transport.disconnect().await {
            Ok(done) => {
                info!("Disconnected");
                Ok(done)
            }
            Err(e) => {
                let err = normalize(&e, ErrorCode::DisconnectFailed);
                warn!("Disconnect failed: {err}");
                Err(ProtocolError::new(ErrorCode::DisconnectFailed, err.message))
            }
        }
    }

    /// Ask the transport and sync the local state. A failing query counts
    /// as disconnected.
    pub async fn is_connected(&self) -> bool {
        let connected = match self.transport.is_connected().await {
            Ok(connected) => connected,
            Err(e) => {
                debug!("Connection query failed: {e}");
                false
            }
        };

        let mut status = self.status.lock();
        status.state.connected = connected;
        match (connected, status.phase) {
            (true, _) => status.phase = ConnectionPhase::Connected,
            (false, ConnectionPhase::Connected) => status.phase = ConnectionPhase::Disconnected,
            _ => {}
        }
        connected
    }

    /// Abort the pending reconnect timer, if any.
    pub fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            if !task.is_finished() {
                debug!("Pending reconnect cancelled");
            }
            task.abort();
        }
    }

    fn mark_disconnected(&self) {
        {
            let mut status = self.status.lock();
            status.state = ConnectionState::default();
            status.phase = ConnectionPhase::Disconnected;
        }
        *self.server_info.write() = None;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Server metadata
    // ─────────────────────────────────────────────────────────────────────

    pub fn cached_server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Fetch server metadata and cache it. Failures and `"null"` yield `None`.
    pub async fn refresh_server_info(&self) -> Option<ServerInfo> {
        let raw = match self.transport.get_server_info().await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Server info unavailable: {e}");
                return None;
            }
        };
        if raw.trim() == "null" {
            return None;
        }
        match serde_json::from_str::<ServerInfo>(&raw) {
            Ok(info) => {
                *self.server_info.write() = Some(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!("{}", ProtocolError::malformed("server info", e));
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Push events
    // ─────────────────────────────────────────────────────────────────────

    /// Apply a push event to the connection state. Runs before subscribers
    /// see the event.
    pub fn handle_push_event(self: &Arc<Self>, event: &McpEvent) {
        match event {
            McpEvent::ConnectionState(update) => {
                let mut status = self.status.lock();
                status.state.connected = update.connected;
                status.state.server_name = update.server_name.clone();
                match (update.connected, status.phase) {
                    (true, _) => status.phase = ConnectionPhase::Connected,
                    (false, ConnectionPhase::Connected) => status.phase = ConnectionPhase::Disconnected,
                    _ => {}
                }
            }
            McpEvent::Error(err) if err.is_connection_lost() => self.on_connection_lost(),
            _ => {}
        }
    }

    fn on_connection_lost(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if status.phase != ConnectionPhase::Connected {
                debug!("Connection-lost signal ignored in phase {:?}", status.phase);
                return;
            }
            status.phase = ConnectionPhase::Reconnecting;
            status.state.connected = false;
        }

        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let epoch = self.disconnect_epoch.load(Ordering::Acquire);
        let delay = self.reconnect_delay;
        let manager = Arc::downgrade(self);
        warn!("Connection lost, reconnecting in {}ms", delay.as_millis());

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.reconnect_now(epoch).await;
            }
        }));
    }

    async fn reconnect_now(self: &Arc<Self>, epoch: u64) {
        if self.disconnect_epoch.load(Ordering::Acquire) != epoch {
            debug!("Reconnect skipped: disconnected on purpose");
            return;
        }
        let url = {
            let status = self.status.lock();
            if status.manual_disconnect || status.state.connected {
                debug!("Reconnect skipped");
                return;
            }
            status.last_url.clone()
        };
        let Some(url) = url else {
            self.mark_disconnected();
            return;
        };

        info!("Reconnecting to {url}");
        match self.connect(&url).await {
            Ok(true) => info!("Reconnected to {url}"),
            Ok(false) => warn!("Reconnect to {url} was declined"),
            Err(e) => error!("Reconnect to {url} failed: {e}"),
        }
    }
}

/// Resets local connection state when dropped.
struct ResetOnDrop<'a, T: McpTransport>(&'a ConnectionManager<T>);

impl<T: McpTransport> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.mark_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use mcp_protocol::{ConnectionStateEvent, ErrorEvent};
    use mcp_sim::{Fault, Operation, ScriptedFaults, SimServer};

    use super::*;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
        }
    }

    fn manager(server: &SimServer) -> Arc<ConnectionManager<SimServer>> {
        ConnectionManager::new(Arc::new(server.clone()), fast_retry(), Duration::from_millis(5000))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_success_sets_state_and_server_name() {
        let server = SimServer::reliable();
        let conn = manager(&server);

        assert!(conn.connect("sim://local").await.unwrap());

        assert_eq!(conn.phase(), ConnectionPhase::Connected);
        let state = conn.state();
        assert!(state.connected);
        assert_eq!(state.server_name.as_deref(), Some(server.name()));
        assert_eq!(conn.last_url().as_deref(), Some("sim://local"));
        assert!(conn.cached_server_info().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retryable_failures_become_connection_failed() {
        let server = SimServer::new(ScriptedFaults::new().fail_times(Operation::Connect, Fault::Network, 4));
        let conn = manager(&server);

        let err = conn.connect("sim://local").await.unwrap_err();

        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert_eq!(server.connect_calls(), 4);
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_connect_failure_keeps_its_code() {
        let server = SimServer::new(
            ScriptedFaults::new().fail(Operation::Connect, Fault::Coded(ErrorCode::AuthenticationError)),
        );
        let conn = manager(&server);

        let err = conn.connect("sim://local").await.unwrap_err();

        assert_eq!(err.code, ErrorCode::AuthenticationError);
        assert_eq!(server.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_connect_is_ok_false() {
        let server = SimServer::new(ScriptedFaults::new().fail(Operation::Connect, Fault::Decline));
        let conn = manager(&server);

        assert!(!conn.connect("sim://local").await.unwrap());
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.state().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let server = SimServer::new(
            ScriptedFaults::new().latency_of(Operation::Connect, Duration::from_millis(50)),
        );
        let conn = manager(&server);

        let (a, b, c) = tokio::join!(
            conn.connect("sim://local"),
            conn.connect("sim://local"),
            conn.connect("sim://other"),
        );

        assert!(a.unwrap() && b.unwrap() && c.unwrap());
        assert_eq!(server.connect_urls(), ["sim://local"]);
        assert_eq!(server.peak_concurrent_connects(), 1);
        assert_eq!(conn.last_url().as_deref(), Some("sim://local"));

        // The slot is free again afterwards.
        conn.connect("sim://local").await.unwrap();
        assert_eq!(server.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_state_even_on_failure() {
        let server = SimServer::new(ScriptedFaults::new().fail(Operation::Disconnect, Fault::Network));
        let conn = manager(&server);
        conn.connect("sim://local").await.unwrap();

        let err = conn.disconnect().await.unwrap_err();

        assert_eq!(err.code, ErrorCode::DisconnectFailed);
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.state().connected);
        assert!(conn.cached_server_info().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_schedules_one_reconnect() {
        let server = SimServer::reliable();
        let conn = manager(&server);
        conn.connect("sim://local").await.unwrap();

        let lost = McpEvent::Error(ErrorEvent::connection_lost("gone"));
        conn.handle_push_event(&lost);
        conn.handle_push_event(&lost);

        assert_eq!(conn.phase(), ConnectionPhase::Reconnecting);
        assert!(conn.reconnect_pending());

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(server.connect_calls(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.connect_calls(), 2);
        assert_eq!(conn.phase(), ConnectionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let server = SimServer::reliable();
        let conn = manager(&server);
        conn.connect("sim://local").await.unwrap();

        conn.handle_push_event(&McpEvent::Error(ErrorEvent::connection_lost("gone")));
        conn.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(server.connect_calls(), 1);
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_reconnect_frees_the_connect_slot() {
        let server = SimServer::new(
            ScriptedFaults::new().latency_of(Operation::Connect, Duration::from_millis(500)),
        );
        let conn = ConnectionManager::new(Arc::new(server.clone()), fast_retry(), Duration::from_millis(100));
        conn.connect("sim://old").await.unwrap();

        conn.handle_push_event(&McpEvent::Error(ErrorEvent::connection_lost("gone")));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.connect_calls(), 2);
        assert_eq!(conn.phase(), ConnectionPhase::Connecting);

        conn.disconnect().await.unwrap();
        assert!(conn.connect("sim://new").await.unwrap());

        assert_eq!(server.connect_urls(), ["sim://old", "sim://old", "sim://new"]);
        assert_eq!(conn.last_url().as_deref(), Some("sim://new"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(server.connect_calls(), 3);
        assert_eq!(conn.phase(), ConnectionPhase::Connected);
        assert_eq!(conn.last_url().as_deref(), Some("sim://new"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_finishing_after_disconnect_is_discarded() {
        let server = SimServer::new(
            ScriptedFaults::new().latency_of(Operation::Connect, Duration::from_millis(500)),
        );
        let conn = manager(&server);

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect("sim://local").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.disconnect().await.unwrap();

        assert!(!pending.await.unwrap().unwrap());
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.state().connected);
        assert!(conn.last_url().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_while_disconnected_is_ignored() {
        let server = SimServer::reliable();
        let conn = manager(&server);

        conn.handle_push_event(&McpEvent::Error(ErrorEvent::connection_lost("gone")));

        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.reconnect_pending());
    }

    #[tokio::test]
    async fn connection_state_push_overwrites_local_state() {
        let server = SimServer::reliable();
        let conn = manager(&server);

        conn.handle_push_event(&McpEvent::ConnectionState(ConnectionStateEvent {
            connected: true,
            server_name: Some("remote".into()),
        }));
        assert_eq!(conn.phase(), ConnectionPhase::Connected);
        assert_eq!(conn.state().server_name.as_deref(), Some("remote"));

        // The transport is asked directly and wins.
        assert!(!conn.is_connected().await);
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn retry_config_partial_update() {
        let conn = manager(&SimServer::reliable());
        conn.set_retry_config(&RetryConfigUpdate {
            initial_delay_ms: Some(10),
            ..Default::default()
        });
        let retry = conn.retry_config();
        assert_eq!(retry.initial_delay_ms, 10);
        assert_eq!(retry.max_retries, 3);
    }
}
