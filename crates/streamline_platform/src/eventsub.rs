#![forbid(unsafe_code)]

//! Event-subscription connector: welcome handshake, out-of-band subscription
//! creation and notification routing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;
use crate::connector::Connector;
use crate::error::{ConfigError, HandshakeError};
use crate::event::{CONNECT_EVENT, DISCONNECT_EVENT, EventPayload, PlatformBridge};
use crate::http::{HttpClient, HttpMethod, HttpRequest};
use crate::options::ConnectorOptions;
use crate::transport::{Socket, TransportCommand, TransportEvent, TransportFactory, TransportLink};

pub const EVENTSUB_NAME: &str = "eventsub";

pub const WS_CONNECT_EVENT: &str = "eventsub.ws-connect";
pub const KEEPALIVE_EVENT: &str = "eventsub.keepalive";
pub const SUBSCRIBE_FAILED_EVENT: &str = "eventsub.subscribe-failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSubPhase {
	Idle,
	Connecting,
	AwaitingWelcome,
	Subscribing,
	Connected,
}

#[derive(Debug)]
enum Signal {
	Welcome(u64, String),
	Closed(u64),
	Cancelled,
}

#[derive(Debug, Deserialize)]
struct FrameMetadata {
	message_type: String,
	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Frame {
	metadata: FrameMetadata,
	#[serde(default)]
	payload: Value,
}

#[derive(Debug, Serialize)]
struct SubscriptionCondition<'a> {
	broadcaster_user_id: &'a str,
	moderator_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct WebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateSubscription<'a> {
	r#type: &'a str,
	version: &'static str,
	condition: SubscriptionCondition<'a>,
	transport: WebsocketTransport<'a>,
}

/// API version for a subscription type.
pub fn subscription_version(kind: &str) -> &'static str {
	match kind {
		"channel.follow" => "2",
		_ => "1",
	}
}

struct EventSubState {
	phase: EventSubPhase,
	socket: Option<Socket>,
	next_generation: u64,
	session: u64,
	session_id: Option<String>,
	handshake: Option<mpsc::UnboundedSender<Signal>>,
}

struct EventSubShared {
	user_id: String,
	token: SecretString,
	client_id: String,
	topics: Vec<String>,
	url: String,
	subscriptions_url: String,
	handshake_timeout: Option<Duration>,
	transport: TransportFactory,
	http: Arc<dyn HttpClient>,
	bridge: PlatformBridge,
	state: Mutex<EventSubState>,
}

pub struct EventSubConnector {
	shared: Arc<EventSubShared>,
}

impl EventSubConnector {
	pub fn new(options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let user = options.require_user()?;
		let user_id = user.require_id()?.to_string();
		let token = user.require_token()?.clone();
		let client_id = options.client_id.clone().ok_or(ConfigError::MissingClientId)?;
		if options.eventsub_topics.is_empty() {
			return Err(ConfigError::MissingTopics);
		}

		Ok(Self {
			shared: Arc::new(EventSubShared {
				user_id,
				token,
				client_id,
				topics: options.eventsub_topics.clone(),
				url: options.eventsub_url.clone(),
				subscriptions_url: options.subscriptions_url.clone(),
				handshake_timeout: options.handshake_timeout,
				transport: options.transport_factory(),
				http: options.http_client()?,
				bridge: PlatformBridge::new(),
				state: Mutex::new(EventSubState {
					phase: EventSubPhase::Idle,
					socket: None,
					next_generation: 0,
					session: 0,
					session_id: None,
					handshake: None,
				}),
			}),
		})
	}

	pub fn factory(options: &ConnectorOptions) -> Result<Box<dyn Connector>, ConfigError> {
		Ok(Box::new(Self::new(options)?))
	}

	pub fn phase(&self) -> EventSubPhase {
		self.shared.state.lock().phase
	}

	/// Session id from the most recent welcome frame.
	pub fn session_id(&self) -> Option<String> {
		self.shared.state.lock().session_id.clone()
	}
}

impl Drop for EventSubConnector {
	fn drop(&mut self) {
		if let Some(socket) = self.shared.state.lock().socket.take() {
			socket.shutdown();
		}
	}
}

impl EventSubShared {
	fn set_phase(&self, session: u64, phase: EventSubPhase) {
		let mut st = self.state.lock();
		if st.session == session {
			st.phase = phase;
		}
	}

	fn signal(&self, signal: Signal) {
		if let Some(tx) = &self.state.lock().handshake {
			let _ = tx.send(signal);
		}
	}

	fn subscription_request(&self, kind: &str, session_id: &str) -> anyhow::Result<HttpRequest> {
		let body = CreateSubscription {
			r#type: kind,
			version: subscription_version(kind),
			condition: SubscriptionCondition {
				broadcaster_user_id: &self.user_id,
				moderator_user_id: &self.user_id,
			},
			transport: WebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		Ok(HttpRequest {
			method: HttpMethod::Post,
			url: self.subscriptions_url.clone(),
			headers: vec![
				("Authorization".to_string(), format!("Bearer {}", self.token.expose())),
				("Client-Id".to_string(), self.client_id.clone()),
				("Content-Type".to_string(), "application/json".to_string()),
			],
			body: Some(serde_json::to_string(&body).with_context(|| format!("encode subscription (type={kind})"))?),
		})
	}

	async fn subscribe(&self, kind: &str, session_id: &str) -> anyhow::Result<()> {
		let request = self.subscription_request(kind, session_id)?;
		let resp = self
			.http
			.send(request)
			.await
			.with_context(|| format!("POST subscription send (type={kind})"))?;

		if !resp.ok() {
			anyhow::bail!(
				"create subscription failed (type={kind}): status={} body={}",
				resp.status,
				resp.body
			);
		}
		debug!(connector = EVENTSUB_NAME, sub_type = %kind, "subscription created");
		Ok(())
	}

	async fn subscribe_all(&self, session_id: &str) {
		let results = join_all(self.topics.iter().map(|kind| async move { (kind, self.subscribe(kind, session_id).await) })).await;

		for (kind, result) in results {
			if let Err(e) = result {
				metrics::counter!("streamline_eventsub_subscribe_errors_total").increment(1);
				warn!(connector = EVENTSUB_NAME, sub_type = %kind, error = %e, "eventsub subscription failed");
				self.bridge.emit(
					SUBSCRIBE_FAILED_EVENT,
					EventPayload::Notification(json!({ "type": kind, "error": format!("{e:#}") })),
				);
			}
		}
	}

	async fn handshake(
		self: &Arc<Self>,
		session: u64,
		signals: &mut mpsc::UnboundedReceiver<Signal>,
	) -> Result<bool, HandshakeError> {
		let url = Url::parse(&self.url)
			.map_err(|e| HandshakeError::Transport(format!("invalid eventsub url {}: {e}", self.url)))?;
		let link = (self.transport)(url)
			.await
			.map_err(|e| HandshakeError::Transport(format!("{e:#}")))?;
		let generation = self.install(session, link)?;

		let session_id = loop {
			match signals.recv().await {
				Some(Signal::Welcome(g, id)) if g == generation => break id,
				Some(Signal::Closed(g)) if g == generation => return Err(HandshakeError::Closed),
				Some(Signal::Cancelled) | None => return Err(HandshakeError::Cancelled),
				Some(_) => {}
			}
		};

		self.set_phase(session, EventSubPhase::Subscribing);
		info!(connector = EVENTSUB_NAME, session_id = %session_id, topics = ?self.topics, "eventsub welcome; creating subscriptions");
		let subscribing = self.subscribe_all(&session_id);
		tokio::pin!(subscribing);
		loop {
			tokio::select! {
				() = &mut subscribing => return Ok(true),
				signal = signals.recv() => match signal {
					Some(Signal::Closed(g)) if g == generation => return Err(HandshakeError::Closed),
					Some(Signal::Cancelled) | None => return Err(HandshakeError::Cancelled),
					Some(_) => {}
				},
			}
		}
	}

	fn install(self: &Arc<Self>, session: u64, link: TransportLink) -> Result<u64, HandshakeError> {
		let TransportLink { outbound, inbound } = link;

		let mut st = self.state.lock();
		if st.session != session {
			let _ = outbound.send(TransportCommand::Close);
			return Err(HandshakeError::Cancelled);
		}

		st.next_generation += 1;
		let generation = st.next_generation;
		let reader = tokio::spawn(read_loop(Arc::clone(self), generation, inbound));
		if let Some(stale) = st.socket.replace(Socket {
			generation,
			tx: outbound,
			tasks: vec![reader],
		}) {
			stale.shutdown();
		}
		Ok(generation)
	}

	fn on_open(&self) {
		{
			let mut st = self.state.lock();
			if st.handshake.is_some() {
				st.phase = EventSubPhase::AwaitingWelcome;
			}
		}
		self.bridge.emit(WS_CONNECT_EVENT, EventPayload::Empty);
	}

	fn route_frame(&self, generation: u64, text: &str) {
		metrics::counter!("streamline_eventsub_frames_total").increment(1);

		let frame: Frame = match serde_json::from_str(text) {
			Ok(f) => f,
			Err(e) => {
				warn!(connector = EVENTSUB_NAME, error = %e, "dropping unparseable frame");
				return;
			}
		};

		match frame.metadata.message_type.as_str() {
			"session_welcome" => {
				let Some(id) = frame.payload.pointer("/session/id").and_then(Value::as_str) else {
					warn!(connector = EVENTSUB_NAME, "welcome frame without session id");
					return;
				};
				self.state.lock().session_id = Some(id.to_string());
				self.signal(Signal::Welcome(generation, id.to_string()));
			}
			"session_keepalive" => {
				self.bridge.emit(KEEPALIVE_EVENT, EventPayload::Empty);
			}
			other => {
				let kind = frame
					.metadata
					.subscription_type
					.unwrap_or_else(|| format!("{EVENTSUB_NAME}.{other}"));
				let data = match frame.payload {
					Value::Object(mut fields) => match fields.remove("event") {
						Some(event) => event,
						None => Value::Object(fields),
					},
					other => other,
				};
				self.bridge.emit(kind, EventPayload::Notification(data));
			}
		}
	}

	fn on_closed(&self, generation: u64, reason: Option<String>) {
		let emit_disconnect = {
			let mut st = self.state.lock();
			if !st.socket.as_ref().is_some_and(|s| s.generation == generation) {
				return;
			}
			st.socket = None;
			st.session_id = None;

			if let Some(tx) = &st.handshake {
				let _ = tx.send(Signal::Closed(generation));
				false
			} else if st.phase == EventSubPhase::Connected {
				st.phase = EventSubPhase::Idle;
				true
			} else {
				false
			}
		};

		if emit_disconnect {
			warn!(connector = EVENTSUB_NAME, reason = ?reason, "eventsub transport closed");
			self.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(EVENTSUB_NAME.to_string()));
		}
	}
}

async fn read_loop(shared: Arc<EventSubShared>, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
	while let Some(event) = inbound.recv().await {
		match event {
			TransportEvent::Open => shared.on_open(),
			TransportEvent::Text(frame) => shared.route_frame(generation, &frame),
			TransportEvent::Closed(reason) => {
				shared.on_closed(generation, reason);
				return;
			}
		}
	}
	shared.on_closed(generation, None);
}

#[async_trait]
impl Connector for EventSubConnector {
	fn name(&self) -> &'static str {
		EVENTSUB_NAME
	}

	fn bridge(&self) -> &PlatformBridge {
		&self.shared.bridge
	}

	async fn connect(&self) -> Result<bool, HandshakeError> {
		let shared = &self.shared;
		let (tx, mut signals) = mpsc::unbounded_channel();
		let session = {
			let mut st = shared.state.lock();
			if st.phase != EventSubPhase::Idle {
				return Ok(false);
			}
			st.phase = EventSubPhase::Connecting;
			st.session += 1;
			st.handshake = Some(tx);
			st.session
		};

		let mut result = match shared.handshake_timeout {
			None => shared.handshake(session, &mut signals).await,
			Some(limit) => tokio::time::timeout(limit, shared.handshake(session, &mut signals))
				.await
				.unwrap_or(Err(HandshakeError::Timeout)),
		};

		{
			let mut st = shared.state.lock();
			if st.session != session {
				return Err(result.err().unwrap_or(HandshakeError::Cancelled));
			}
			st.handshake = None;
			if result.is_ok() && st.socket.is_none() {
				result = Err(HandshakeError::Closed);
			}
			match &result {
				Ok(_) => st.phase = EventSubPhase::Connected,
				Err(_) => {
					st.phase = EventSubPhase::Idle;
					st.session_id = None;
					if let Some(socket) = st.socket.take() {
						socket.shutdown();
					}
				}
			}
		}

		match &result {
			Ok(_) => {
				info!(connector = EVENTSUB_NAME, "eventsub connected");
				shared
					.bridge
					.emit(CONNECT_EVENT, EventPayload::Lifecycle(EVENTSUB_NAME.to_string()));
			}
			Err(e) => warn!(connector = EVENTSUB_NAME, error = %e, "eventsub handshake failed"),
		}
		result
	}

	async fn disconnect(&self) {
		let (socket, handshake) = {
			let mut st = self.shared.state.lock();
			st.phase = EventSubPhase::Idle;
			st.session += 1;
			st.session_id = None;
			(st.socket.take(), st.handshake.take())
		};

		if let Some(tx) = handshake {
			let _ = tx.send(Signal::Cancelled);
		}
		if let Some(socket) = socket {
			socket.shutdown();
			info!(connector = EVENTSUB_NAME, "eventsub disconnected");
			self.shared
				.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(EVENTSUB_NAME.to_string()));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_table() {
		assert_eq!(subscription_version("channel.follow"), "2");
		assert_eq!(subscription_version("channel.cheer"), "1");
	}

	#[test]
	fn subscription_body_shape() {
		let body = CreateSubscription {
			r#type: "channel.follow",
			version: subscription_version("channel.follow"),
			condition: SubscriptionCondition {
				broadcaster_user_id: "42",
				moderator_user_id: "42",
			},
			transport: WebsocketTransport {
				method: "websocket",
				session_id: "s1",
			},
		};
		assert_eq!(
			serde_json::to_value(&body).expect("encode"),
			json!({
				"type": "channel.follow",
				"version": "2",
				"condition": { "broadcaster_user_id": "42", "moderator_user_id": "42" },
				"transport": { "method": "websocket", "session_id": "s1" }
			})
		);
	}
}
