//! Notification name constants.
//!
//! Notifications are server-to-client messages with no response expected.
//! The WebSocket transport maps each one onto a push-event category.

use crate::events::EventCategory;

/// All server → client notification names.
pub struct Notifications;

impl Notifications {
    pub const CONNECTION_STATE: &str = "notifications/connectionState";
    pub const TOOL_CALL: &str = "notifications/toolCall";
    pub const RESOURCE_REQUEST: &str = "notifications/resourceRequest";
    pub const ERROR: &str = "notifications/error";

    /// The push-event category a notification feeds, if any.
    pub fn category(method: &str) -> Option<EventCategory> {
        match method {
            Self::CONNECTION_STATE => Some(EventCategory::ConnectionState),
            Self::TOOL_CALL => Some(EventCategory::ToolCall),
            Self::RESOURCE_REQUEST => Some(EventCategory::ResourceRequest),
            Self::ERROR => Some(EventCategory::Error),
            _ => None,
        }
    }
}

/// Type alias for notification names.
pub type NotificationName = &'static str;
