#![forbid(unsafe_code)]

//! Hierarchical publish/subscribe bus keyed by dotted event types.
//!
//! Subscribers register against one literal pattern (`chat.message`, `chat.*`, `*`).
//! Publishing `sub.gift.anon` reaches the patterns `sub.gift.anon`, `sub.gift.*`,
//! `sub.*` and `*`, most specific first. Delivery is deferred to a per-bridge
//! dispatcher task, so no handler runs inside the publishing call.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pattern that matches every event.
pub const WILDCARD: &str = "*";

/// Published event as seen by a handler.
pub struct Event<T> {
	/// Dotted type the event was published under.
	pub kind: String,

	pub data: Arc<T>,

	/// Pattern the receiving subscription was registered on.
	pub source: Option<String>,
}

impl<T> Event<T> {
	pub fn new(kind: impl Into<String>, data: T) -> Self {
		Self {
			kind: kind.into(),
			data: Arc::new(data),
			source: None,
		}
	}
}

impl<T> Clone for Event<T> {
	fn clone(&self) -> Self {
		Self {
			kind: self.kind.clone(),
			data: Arc::clone(&self.data),
			source: self.source.clone(),
		}
	}
}

impl<T: fmt::Debug> fmt::Debug for Event<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Event")
			.field("kind", &self.kind)
			.field("source", &self.source)
			.field("data", &self.data)
			.finish()
	}
}

pub type Handler<T> = Arc<dyn Fn(&Event<T>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remaining {
	Forever,
	Times(u32),
}

struct Entry<T> {
	id: u64,
	remaining: Remaining,
	handler: Handler<T>,
}

struct Delivery<T> {
	handler: Handler<T>,
	event: Event<T>,
}

struct Inner<T> {
	handlers: Mutex<BTreeMap<String, Vec<Entry<T>>>>,
	next_id: AtomicU64,
	queue_tx: mpsc::UnboundedSender<Delivery<T>>,

	/// Receiver parked until the dispatcher is spawned on first publish.
	queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery<T>>>>,
}

/// Cheap cloneable handle to a bus.
pub struct EventBridge<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBridge<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> fmt::Debug for EventBridge<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let patterns = self.inner.handlers.lock().len();
		f.debug_struct("EventBridge").field("patterns", &patterns).finish()
	}
}

impl<T: Send + Sync + 'static> Default for EventBridge<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// Handle returned by every registration.
///
/// Dropping it keeps the subscription alive; call [`Unsubscribe::unsubscribe`] to remove it.
#[must_use = "dropping the handle leaves the subscription registered"]
pub struct Unsubscribe<T> {
	inner: Weak<Inner<T>>,
	pattern: String,
	id: u64,
}

impl<T> Unsubscribe<T> {
	pub fn pattern(&self) -> &str {
		&self.pattern
	}

	/// Remove the subscription. Returns `false` when it was already gone.
	pub fn unsubscribe(self) -> bool {
		let Some(inner) = self.inner.upgrade() else {
			return false;
		};
		let mut handlers = inner.handlers.lock();
		let Some(entries) = handlers.get_mut(&self.pattern) else {
			return false;
		};
		let before = entries.len();
		entries.retain(|e| e.id != self.id);
		let removed = entries.len() != before;
		if entries.is_empty() {
			handlers.remove(&self.pattern);
		}
		removed
	}
}

impl<T> fmt::Debug for Unsubscribe<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Unsubscribe")
			.field("pattern", &self.pattern)
			.field("id", &self.id)
			.finish()
	}
}

/// Match candidates for a dotted type, most specific first.
///
/// `trace_path("sub.gift.anon")` is `["sub.gift.anon", "sub.gift.*", "sub.*", "*"]`.
pub fn trace_path(kind: &str) -> Vec<String> {
	let segments: Vec<&str> = kind.split('.').collect();
	let mut out = Vec::with_capacity(segments.len() + 1);
	out.push(kind.to_string());
	for end in (1..segments.len()).rev() {
		out.push(format!("{}.{WILDCARD}", segments[..end].join(".")));
	}
	out.push(WILDCARD.to_string());
	out.dedup();
	out
}

impl<T: Send + Sync + 'static> EventBridge<T> {
	pub fn new() -> Self {
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		Self {
			inner: Arc::new(Inner {
				handlers: Mutex::new(BTreeMap::new()),
				next_id: AtomicU64::new(1),
				queue_tx,
				queue_rx: Mutex::new(Some(queue_rx)),
			}),
		}
	}

	/// Register a durable subscription on one literal pattern.
	pub fn on<F>(&self, pattern: impl Into<String>, handler: F) -> Unsubscribe<T>
	where
		F: Fn(&Event<T>) + Send + Sync + 'static,
	{
		self.register(pattern.into(), Remaining::Forever, Arc::new(handler))
	}

	/// Register a subscription removed after its first delivery is scheduled.
	pub fn once<F>(&self, pattern: impl Into<String>, handler: F) -> Unsubscribe<T>
	where
		F: Fn(&Event<T>) + Send + Sync + 'static,
	{
		self.register(pattern.into(), Remaining::Times(1), Arc::new(handler))
	}

	fn register(&self, pattern: String, remaining: Remaining, handler: Handler<T>) -> Unsubscribe<T> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner
			.handlers
			.lock()
			.entry(pattern.clone())
			.or_default()
			.push(Entry { id, remaining, handler });

		Unsubscribe {
			inner: Arc::downgrade(&self.inner),
			pattern,
			id,
		}
	}

	/// Publish an event. Returns the number of deliveries scheduled.
	pub fn emit(&self, kind: impl Into<String>, data: T) -> usize {
		self.emit_shared(kind.into(), Arc::new(data))
	}

	/// Alias of [`EventBridge::emit`].
	pub fn fire(&self, kind: impl Into<String>, data: T) -> usize {
		self.emit(kind, data)
	}

	fn emit_shared(&self, kind: String, data: Arc<T>) -> usize {
		let mut deliveries = Vec::new();
		{
			let mut handlers = self.inner.handlers.lock();
			for candidate in trace_path(&kind) {
				let Some(entries) = handlers.get_mut(&candidate) else {
					continue;
				};

				for entry in entries.iter_mut() {
					if entry.remaining == Remaining::Times(0) {
						continue;
					}
					if let Remaining::Times(n) = &mut entry.remaining {
						*n -= 1;
					}
					deliveries.push(Delivery {
						handler: Arc::clone(&entry.handler),
						event: Event {
							kind: kind.clone(),
							data: Arc::clone(&data),
							source: Some(candidate.clone()),
						},
					});
				}

				entries.retain(|e| e.remaining != Remaining::Times(0));
				if entries.is_empty() {
					handlers.remove(&candidate);
				}
			}
		}

		if deliveries.is_empty() {
			return 0;
		}

		self.ensure_dispatcher();
		let scheduled = deliveries.len();
		for delivery in deliveries {
			if self.inner.queue_tx.send(delivery).is_err() {
				warn!(kind = %kind, "bridge dispatcher gone; dropping delivery");
				return 0;
			}
		}
		scheduled
	}

	fn ensure_dispatcher(&self) {
		let mut parked = self.inner.queue_rx.lock();
		if parked.is_none() {
			return;
		}

		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("no tokio runtime; bridge deliveries stay queued until one publishes from a runtime");
			return;
		};

		if let Some(rx) = parked.take() {
			handle.spawn(dispatch(rx));
		}
	}

	/// Clear every registered pattern.
	pub fn remove_all(&self) {
		self.inner.handlers.lock().clear();
	}

	/// Number of live subscriptions on one literal pattern.
	pub fn handler_count(&self, pattern: &str) -> usize {
		self.inner.handlers.lock().get(pattern).map_or(0, Vec::len)
	}

	/// Republish every event seen on `source` onto this bridge.
	///
	/// With a prefix, `chat.message` is republished as `<prefix>.chat.message`.
	pub fn pull(&self, source: &EventBridge<T>, prefix: Option<&str>) -> Unsubscribe<T> {
		let dest = Arc::downgrade(&self.inner);
		let prefix = prefix.map(str::to_string);

		source.on(WILDCARD, move |event: &Event<T>| {
			let Some(inner) = dest.upgrade() else {
				return;
			};
			let dest = EventBridge { inner };
			let kind = match &prefix {
				Some(p) => format!("{p}.{}", event.kind),
				None => event.kind.clone(),
			};
			dest.emit_shared(kind, Arc::clone(&event.data));
		})
	}

	/// Republish every event seen on this bridge onto `dest`.
	pub fn forward(&self, dest: &EventBridge<T>, prefix: Option<&str>) -> Unsubscribe<T> {
		dest.pull(self, prefix)
	}

	/// Receive matching events through a channel instead of a callback.
	pub fn stream(&self, pattern: impl Into<String>) -> (Unsubscribe<T>, mpsc::UnboundedReceiver<Event<T>>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let sub = self.on(pattern, move |event: &Event<T>| {
			let _ = tx.send(event.clone());
		});
		(sub, rx)
	}
}

async fn dispatch<T: Send + Sync + 'static>(mut rx: mpsc::UnboundedReceiver<Delivery<T>>) {
	while let Some(Delivery { handler, event }) = rx.recv().await {
		if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
			metrics::counter!("streamline_bridge_handler_panics_total").increment(1);
			warn!(kind = %event.kind, source = ?event.source, "bridge handler panicked");
		}
	}
	debug!("bridge dispatcher stopped");
}
