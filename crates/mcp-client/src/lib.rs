//! MCP client core.
//!
//! - `connection`: lifecycle, single in-flight connect, delayed reconnect
//! - `retry` / `normalize`: backoff and the error taxonomy boundary
//! - `rpc` / `tools`: tool and resource calls
//! - `events`: typed push-event bus
//! - `session`: streaming transcription sessions
//! - `client`: `McpClient`, the context tying them together

pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod normalize;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod tools;

pub use client::McpClient;
pub use config::{ClientConfig, ConfigError, RetryConfig, RetryConfigUpdate};
pub use connection::{ConnectionManager, ConnectionPhase, ConnectionState};
pub use events::{EventBus, Handler, Subscription};
pub use normalize::normalize;
pub use retry::{is_retryable, with_retry};
pub use rpc::RpcLayer;
pub use session::{SessionManager, SessionState, TranscriptionSession};
pub use tools::{CalendarEvent, Note, ReminderItem, ToolHelpers};
