#![forbid(unsafe_code)]

use crate::connector::ConnectorOp;

/// Missing or conflicting options, reported at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid config: user not provided")]
	MissingUser,

	#[error("Invalid config: user.name not provided")]
	MissingUserName,

	#[error("Invalid config: user.id not provided")]
	MissingUserId,

	#[error("Invalid config: user.token not provided")]
	MissingUserToken,

	#[error("Invalid config: channel not provided")]
	MissingChannel,

	#[error("Invalid config: topics not provided")]
	MissingTopics,

	#[error("Invalid config: client id not provided")]
	MissingClientId,

	#[error("Invalid config: operation `{op}` provided by both {first} and {second}")]
	DuplicateOperation {
		op: ConnectorOp,
		first: &'static str,
		second: &'static str,
	},

	#[error("Invalid config: http client unavailable: {0}")]
	HttpClient(String),
}

/// Server-reported or transport-level handshake failure, returned from `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
	#[error("join confirmed for #{actual}, expected #{expected}")]
	JoinMismatch { expected: String, actual: String },

	#[error("{0}")]
	Notice(String),

	#[error("Connection is compromised")]
	NonceMismatch,

	#[error("{0}")]
	Rejected(String),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("transport closed during handshake")]
	Closed,

	#[error("handshake cancelled by disconnect")]
	Cancelled,

	#[error("handshake timed out")]
	Timeout,

	#[error("no join confirmation after {attempts} attempts")]
	RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SayError {
	#[error("not connected")]
	NotConnected,

	#[error("no acknowledgement before timeout")]
	Timeout,

	#[error("connection dropped before acknowledgement")]
	Disconnected,

	#[error("connector does not support say")]
	Unsupported,
}
