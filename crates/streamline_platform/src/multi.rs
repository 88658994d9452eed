#![forbid(unsafe_code)]

//! Several connectors behind one bridge and one operation table.

use std::collections::BTreeMap;

use futures::future::join_all;
use parking_lot::Mutex;
use streamline_bridge::{Event, Unsubscribe};
use tracing::{debug, info};

use crate::chat::ChatConnector;
use crate::connector::{Connector, ConnectorFactory, ConnectorOp, SayReceipt};
use crate::error::{ConfigError, HandshakeError, SayError};
use crate::event::{EventPayload, PlatformBridge};
use crate::options::ConnectorOptions;
use crate::pubsub::PubsubConnector;

pub struct Multi {
	bridge: PlatformBridge,
	children: Vec<Box<dyn Connector>>,
	links: Mutex<Vec<Unsubscribe<EventPayload>>>,
	ops: BTreeMap<ConnectorOp, usize>,
}

impl Multi {
	/// Build every child in order. The first factory error aborts construction.
	pub fn new(factories: &[ConnectorFactory], options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let mut children = Vec::with_capacity(factories.len());
		for factory in factories {
			children.push(factory(options)?);
		}
		Self::from_children(children)
	}

	/// Chat plus topic-push.
	pub fn realtime(options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let factories: [ConnectorFactory; 2] = [ChatConnector::factory, PubsubConnector::factory];
		Self::new(&factories, options)
	}

	pub fn from_children(children: Vec<Box<dyn Connector>>) -> Result<Self, ConfigError> {
		let mut ops: BTreeMap<ConnectorOp, usize> = BTreeMap::new();
		for (idx, child) in children.iter().enumerate() {
			for &op in child.ops() {
				if let Some(&first) = ops.get(&op) {
					return Err(ConfigError::DuplicateOperation {
						op,
						first: children[first].name(),
						second: child.name(),
					});
				}
				ops.insert(op, idx);
			}
		}

		let bridge = PlatformBridge::new();
		let links = children.iter().map(|child| bridge.pull(child.bridge(), None)).collect();
		debug!(children = ?children.iter().map(|c| c.name()).collect::<Vec<_>>(), "multiplexer built");

		Ok(Self {
			bridge,
			children,
			links: Mutex::new(links),
			ops,
		})
	}

	/// Merged bridge carrying every child's events unprefixed.
	pub fn bridge(&self) -> &PlatformBridge {
		&self.bridge
	}

	pub fn on<F>(&self, pattern: impl Into<String>, handler: F) -> Unsubscribe<EventPayload>
	where
		F: Fn(&Event<EventPayload>) + Send + Sync + 'static,
	{
		self.bridge.on(pattern, handler)
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.children.iter().map(|c| c.name()).collect()
	}

	pub fn children(&self) -> &[Box<dyn Connector>] {
		&self.children
	}

	pub fn ops(&self) -> Vec<ConnectorOp> {
		self.ops.keys().copied().collect()
	}

	/// Connect every child concurrently; one result per child, in order.
	pub async fn connect(&self) -> Vec<Result<bool, HandshakeError>> {
		let results = join_all(self.children.iter().map(|c| c.connect())).await;
		info!(
			connected = results.iter().filter(|r| r.is_ok()).count(),
			total = results.len(),
			"multiplexer connect settled"
		);
		results
	}

	pub async fn disconnect(&self) {
		join_all(self.children.iter().map(|c| c.disconnect())).await;
	}

	/// Detach child forwarding. Children keep running; the merged bridge goes quiet.
	pub fn stop(&self) {
		for link in self.links.lock().drain(..) {
			let _ = link.unsubscribe();
		}
	}

	pub async fn say(&self, text: &str, reply_to: Option<&str>) -> Result<SayReceipt, SayError> {
		let Some(&idx) = self.ops.get(&ConnectorOp::Say) else {
			return Err(SayError::Unsupported);
		};
		self.children[idx].say(text, reply_to).await
	}
}

impl Drop for Multi {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::CONNECT_EVENT;
	use async_trait::async_trait;

	struct Stub {
		name: &'static str,
		ops: &'static [ConnectorOp],
		bridge: PlatformBridge,
	}

	#[async_trait]
	impl Connector for Stub {
		fn name(&self) -> &'static str {
			self.name
		}

		fn bridge(&self) -> &PlatformBridge {
			&self.bridge
		}

		async fn connect(&self) -> Result<bool, HandshakeError> {
			self.bridge.emit(CONNECT_EVENT, EventPayload::Lifecycle(self.name.to_string()));
			Ok(true)
		}

		async fn disconnect(&self) {}

		fn ops(&self) -> &'static [ConnectorOp] {
			self.ops
		}
	}

	fn stub(name: &'static str, ops: &'static [ConnectorOp]) -> Box<dyn Connector> {
		Box::new(Stub {
			name,
			ops,
			bridge: PlatformBridge::new(),
		})
	}

	#[test]
	fn colliding_operations_are_rejected() {
		let err = Multi::from_children(vec![stub("a", &[ConnectorOp::Say]), stub("b", &[ConnectorOp::Say])])
			.err()
			.expect("duplicate say");
		assert_eq!(
			err,
			ConfigError::DuplicateOperation {
				op: ConnectorOp::Say,
				first: "a",
				second: "b",
			}
		);
	}

	#[tokio::test]
	async fn say_without_provider_is_unsupported() {
		let multi = Multi::from_children(vec![stub("a", &[])]).expect("multi");
		assert_eq!(multi.say("hi", None).await, Err(SayError::Unsupported));
		assert!(multi.ops().is_empty());
	}

	#[tokio::test]
	async fn connect_reports_each_child() {
		let multi = Multi::from_children(vec![stub("a", &[]), stub("b", &[ConnectorOp::Say])]).expect("multi");
		assert_eq!(multi.names(), vec!["a", "b"]);
		assert_eq!(multi.connect().await, vec![Ok(true), Ok(true)]);
	}
}
