#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use streamline_protocol::Tags;

use crate::error::{ConfigError, HandshakeError, SayError};
use crate::event::PlatformBridge;
use crate::options::ConnectorOptions;

/// Operations beyond the connect/disconnect lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectorOp {
	Say,
}

impl ConnectorOp {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Say => "say",
		}
	}
}

impl fmt::Display for ConnectorOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Server acknowledgement of an outgoing chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SayReceipt {
	pub tags: Tags,
	pub message: String,
}

#[async_trait]
pub trait Connector: Send + Sync {
	/// Name carried by this connector's lifecycle events.
	fn name(&self) -> &'static str;

	fn bridge(&self) -> &PlatformBridge;

	/// `Ok(false)` when a connection already exists or is being set up.
	async fn connect(&self) -> Result<bool, HandshakeError>;

	/// Idempotent.
	async fn disconnect(&self);

	fn ops(&self) -> &'static [ConnectorOp] {
		&[]
	}

	async fn say(&self, _text: &str, _reply_to: Option<&str>) -> Result<SayReceipt, SayError> {
		Err(SayError::Unsupported)
	}
}

pub type ConnectorFactory = fn(&ConnectorOptions) -> Result<Box<dyn Connector>, ConfigError>;
