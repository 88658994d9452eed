#![forbid(unsafe_code)]

use streamline_bridge::EventBridge;
use streamline_protocol::Message;

/// Lifecycle event emitted once a connector finishes its handshake.
pub const CONNECT_EVENT: &str = "connect";
/// Lifecycle event emitted when a connector drops its transport.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Data carried by every published event.
///
/// The dotted type lives on the bridge envelope; the payload shape depends on
/// which connector produced it. Server-added event types land in `Push` or
/// `Notification` with their raw fields intact.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
	/// Parsed chat line.
	Chat(Message),

	/// `connect` / `disconnect`, carrying the connector name.
	Lifecycle(String),

	/// Topic-push frame.
	Push(serde_json::Value),

	/// Event-subscription notification or diagnostic.
	Notification(serde_json::Value),

	Empty,
}

impl EventPayload {
	pub fn as_chat(&self) -> Option<&Message> {
		match self {
			Self::Chat(m) => Some(m),
			_ => None,
		}
	}

	pub fn as_json(&self) -> Option<&serde_json::Value> {
		match self {
			Self::Push(v) | Self::Notification(v) => Some(v),
			_ => None,
		}
	}

	pub fn connector_name(&self) -> Option<&str> {
		match self {
			Self::Lifecycle(name) => Some(name),
			_ => None,
		}
	}
}

pub type PlatformBridge = EventBridge<EventPayload>;
