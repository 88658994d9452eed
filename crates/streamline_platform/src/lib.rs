#![forbid(unsafe_code)]

pub mod chat;
pub mod connector;
pub mod error;
pub mod event;
pub mod eventsub;
pub mod helix;
pub mod http;
pub mod multi;
pub mod nonce;
pub mod options;
pub mod pubsub;
pub mod transport;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use chat::{ChatConnector, ChatPhase};
pub use connector::{Connector, ConnectorFactory, ConnectorOp, SayReceipt};
pub use error::{ConfigError, HandshakeError, SayError};
pub use event::{CONNECT_EVENT, DISCONNECT_EVENT, EventPayload, PlatformBridge};
pub use eventsub::{EventSubConnector, EventSubPhase};
pub use helix::{Helix, HelixError, HelixRequest};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use multi::Multi;
pub use nonce::{NonceSource, SequenceNonce, UuidNonce};
pub use options::{ConnectorOptions, RetryPolicy, UserCredentials};
pub use pubsub::{PubsubConnector, PubsubPhase};
pub use transport::{TransportCommand, TransportEvent, TransportFactory, TransportLink, websocket_transport};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Exponential delay clamped to `[min, max]`.
pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn backoff_grows_and_clamps() {
		let min = Duration::from_millis(100);
		let max = Duration::from_secs(1);
		assert_eq!(backoff_delay(0, min, max), min);
		assert_eq!(backoff_delay(1, min, max), Duration::from_millis(200));
		assert_eq!(backoff_delay(3, min, max), Duration::from_millis(800));
		assert_eq!(backoff_delay(10, min, max), max);
	}
}
