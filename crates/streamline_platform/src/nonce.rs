#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of correlation nonces for `LISTEN` frames and outgoing chat.
pub trait NonceSource: Send + Sync {
	fn next_nonce(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidNonce;

impl NonceSource for UuidNonce {
	fn next_nonce(&self) -> String {
		Uuid::new_v4().simple().to_string()
	}
}

/// Deterministic `<prefix><n>` nonces.
#[derive(Debug, Default)]
pub struct SequenceNonce {
	prefix: String,
	counter: AtomicU64,
}

impl SequenceNonce {
	pub fn new(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			counter: AtomicU64::new(0),
		}
	}
}

impl NonceSource for SequenceNonce {
	fn next_nonce(&self) -> String {
		let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
		format!("{}{n}", self.prefix)
	}
}
