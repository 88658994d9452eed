#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::nonce::{NonceSource, UuidNonce};
use crate::transport::{TransportFactory, websocket_transport};
use crate::{SecretString, backoff_delay};

pub const DEFAULT_CHAT_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
pub const DEFAULT_PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv";
pub const DEFAULT_EVENTSUB_URL: &str = "wss://eventsub-beta.wss.twitch.tv/ws";
pub const DEFAULT_SUBSCRIPTIONS_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";
pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";

/// Join confirmation window before the chat handshake restarts.
pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_millis(7777);
/// Topic-push keepalive interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(150);

/// Account the connectors act as. Each connector checks the fields it needs.
#[derive(Debug, Clone, Default)]
pub struct UserCredentials {
	/// Chat login.
	pub name: Option<String>,

	/// Numeric account id.
	pub id: Option<String>,

	/// OAuth token without the `oauth:` prefix.
	pub token: Option<SecretString>,
}

/// Chat handshake restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// `None` restarts forever.
	pub max_attempts: Option<u32>,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: None,
			base_delay: Duration::ZERO,
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	pub fn bounded(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
		Self {
			max_attempts: Some(max_attempts),
			base_delay,
			max_delay,
		}
	}

	/// Delay before restart number `attempt` (1-based).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		if self.base_delay.is_zero() {
			return Duration::ZERO;
		}
		backoff_delay(attempt.saturating_sub(1), self.base_delay, self.max_delay)
	}

	/// Whether handshake attempt number `attempt` (0-based) may start.
	pub fn allows(&self, attempt: u32) -> bool {
		self.max_attempts.is_none_or(|max| attempt < max)
	}
}

/// Options shared by every connector factory.
#[derive(Clone)]
pub struct ConnectorOptions {
	pub user: Option<UserCredentials>,

	/// Chat channel to join.
	pub channel: Option<String>,

	/// Topic-push topics, scoped to the user id on `LISTEN`.
	pub topics: Vec<String>,

	/// Event-subscription types created after the welcome frame.
	pub eventsub_topics: Vec<String>,

	pub client_id: Option<String>,

	pub chat_timeout: Duration,
	pub retry: RetryPolicy,

	/// Topic-push / event-subscription handshake bound; `None` waits forever.
	pub handshake_timeout: Option<Duration>,

	/// Bound on waiting for a chat acknowledgement; `None` waits forever.
	pub say_timeout: Option<Duration>,

	pub ping_interval: Duration,

	pub chat_url: String,
	pub pubsub_url: String,
	pub eventsub_url: String,
	pub subscriptions_url: String,
	pub helix_base_url: String,

	/// Override the WebSocket transport.
	pub transport: Option<TransportFactory>,

	/// Override the reqwest HTTP client.
	pub http: Option<Arc<dyn HttpClient>>,

	/// Override uuid nonces.
	pub nonces: Option<Arc<dyn NonceSource>>,
}

impl Default for ConnectorOptions {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnectorOptions {
	pub fn new() -> Self {
		Self {
			user: None,
			channel: None,
			topics: Vec::new(),
			eventsub_topics: Vec::new(),
			client_id: None,
			chat_timeout: DEFAULT_CHAT_TIMEOUT,
			retry: RetryPolicy::default(),
			handshake_timeout: None,
			say_timeout: None,
			ping_interval: DEFAULT_PING_INTERVAL,
			chat_url: DEFAULT_CHAT_URL.to_string(),
			pubsub_url: DEFAULT_PUBSUB_URL.to_string(),
			eventsub_url: DEFAULT_EVENTSUB_URL.to_string(),
			subscriptions_url: DEFAULT_SUBSCRIPTIONS_URL.to_string(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			transport: None,
			http: None,
			nonces: None,
		}
	}

	pub(crate) fn transport_factory(&self) -> TransportFactory {
		self.transport.clone().unwrap_or_else(websocket_transport)
	}

	pub(crate) fn nonce_source(&self) -> Arc<dyn NonceSource> {
		match &self.nonces {
			Some(n) => n.clone(),
			None => Arc::new(UuidNonce),
		}
	}

	pub(crate) fn http_client(&self) -> Result<Arc<dyn HttpClient>, ConfigError> {
		if let Some(h) = &self.http {
			return Ok(h.clone());
		}
		let client = ReqwestHttpClient::new().map_err(|e| ConfigError::HttpClient(format!("{e:#}")))?;
		Ok(Arc::new(client))
	}

	pub(crate) fn require_user(&self) -> Result<&UserCredentials, ConfigError> {
		self.user.as_ref().ok_or(ConfigError::MissingUser)
	}
}

impl UserCredentials {
	pub(crate) fn require_name(&self) -> Result<&str, ConfigError> {
		self.name.as_deref().ok_or(ConfigError::MissingUserName)
	}

	pub(crate) fn require_id(&self) -> Result<&str, ConfigError> {
		self.id.as_deref().ok_or(ConfigError::MissingUserId)
	}

	pub(crate) fn require_token(&self) -> Result<&SecretString, ConfigError> {
		self.token.as_ref().ok_or(ConfigError::MissingUserToken)
	}
}

impl fmt::Debug for ConnectorOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectorOptions")
			.field("user", &self.user)
			.field("channel", &self.channel)
			.field("topics", &self.topics)
			.field("eventsub_topics", &self.eventsub_topics)
			.field("client_id", &self.client_id)
			.field("chat_timeout", &self.chat_timeout)
			.field("retry", &self.retry)
			.field("handshake_timeout", &self.handshake_timeout)
			.field("say_timeout", &self.say_timeout)
			.field("ping_interval", &self.ping_interval)
			.field("chat_url", &self.chat_url)
			.field("pubsub_url", &self.pubsub_url)
			.field("eventsub_url", &self.eventsub_url)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_retry_restarts_immediately_forever() {
		let policy = RetryPolicy::default();
		assert!(policy.allows(10_000));
		assert_eq!(policy.delay_for(5), Duration::ZERO);
	}

	#[test]
	fn bounded_retry_backs_off() {
		let policy = RetryPolicy::bounded(3, Duration::from_millis(100), Duration::from_millis(250));
		assert!(policy.allows(2));
		assert!(!policy.allows(3));
		assert_eq!(policy.delay_for(1), Duration::from_millis(100));
		assert_eq!(policy.delay_for(2), Duration::from_millis(200));
		assert_eq!(policy.delay_for(3), Duration::from_millis(250));
	}

	#[test]
	fn debug_does_not_leak_token() {
		let mut options = ConnectorOptions::new();
		options.user = Some(UserCredentials {
			name: Some("bot".into()),
			id: None,
			token: Some(SecretString::new("hunter2")),
		});
		let rendered = format!("{options:?}");
		assert!(!rendered.contains("hunter2"));
	}
}
