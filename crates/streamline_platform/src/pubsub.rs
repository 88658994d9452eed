#![forbid(unsafe_code)]

//! Topic-push connector: `LISTEN` handshake, keepalive pings and `MESSAGE` demultiplexing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;
use crate::connector::Connector;
use crate::error::{ConfigError, HandshakeError};
use crate::event::{CONNECT_EVENT, DISCONNECT_EVENT, EventPayload, PlatformBridge};
use crate::nonce::NonceSource;
use crate::options::ConnectorOptions;
use crate::transport::{Socket, TransportCommand, TransportEvent, TransportFactory, TransportLink};

pub const PUBSUB_NAME: &str = "pubsub";

const PING_FRAME: &str = r#"{"type":"PING"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubsubPhase {
	Idle,
	Connecting,
	AwaitingAck,
	Connected,
}

#[derive(Debug)]
enum Signal {
	Open(u64),
	Response { generation: u64, nonce: String, error: String },
	Closed(u64),
	Cancelled,
}

struct PubsubState {
	phase: PubsubPhase,
	socket: Option<Socket>,
	next_generation: u64,
	session: u64,
	handshake: Option<mpsc::UnboundedSender<Signal>>,
}

struct PubsubShared {
	token: SecretString,

	/// `<topic>.<user id>`
	topics: Vec<String>,

	url: String,
	ping_interval: Duration,
	handshake_timeout: Option<Duration>,
	transport: TransportFactory,
	nonces: Arc<dyn NonceSource>,
	bridge: PlatformBridge,
	state: Mutex<PubsubState>,
}

pub struct PubsubConnector {
	shared: Arc<PubsubShared>,
}

/// `LISTEN` request for the given scoped topics.
pub fn listen_frame(nonce: &str, topics: &[String], token: &str) -> Value {
	json!({
		"type": "LISTEN",
		"nonce": nonce,
		"data": {
			"topics": topics,
			"auth_token": token,
		}
	})
}

/// Split an inbound frame into its event type and payload.
///
/// `MESSAGE` frames are published under the leading segment of their topic with
/// the topic, the inner payload fields and the inner `data` fields merged in that
/// order. Everything else is passed through under its own `type`.
pub fn demux_frame(text: &str) -> anyhow::Result<(String, Value)> {
	let frame: Value = serde_json::from_str(text).context("parse push frame")?;
	let kind = frame
		.get("type")
		.and_then(Value::as_str)
		.context("push frame without type")?
		.to_string();

	if kind != "MESSAGE" {
		return Ok((kind, frame));
	}

	let topic = frame
		.pointer("/data/topic")
		.and_then(Value::as_str)
		.context("MESSAGE without data.topic")?;
	let raw = frame
		.pointer("/data/message")
		.and_then(Value::as_str)
		.context("MESSAGE without data.message")?;
	let inner: Value = serde_json::from_str(raw).with_context(|| format!("parse MESSAGE payload (topic={topic})"))?;

	let mut merged = Map::new();
	merged.insert("topic".to_string(), Value::String(topic.to_string()));
	match inner {
		Value::Object(mut parts) => {
			let data = parts.remove("data");
			merged.extend(parts);
			match data {
				Some(Value::Object(fields)) => merged.extend(fields),
				Some(other) => {
					merged.insert("data".to_string(), other);
				}
				None => {}
			}
		}
		other => {
			merged.insert("message".to_string(), other);
		}
	}

	let event_type = topic.split('.').next().unwrap_or(topic).to_string();
	Ok((event_type, Value::Object(merged)))
}

impl PubsubConnector {
	pub fn new(options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let user = options.require_user()?;
		let user_id = user.require_id()?;
		let token = user.require_token()?.clone();
		if options.topics.is_empty() {
			return Err(ConfigError::MissingTopics);
		}

		let topics = options.topics.iter().map(|t| format!("{t}.{user_id}")).collect();

		Ok(Self {
			shared: Arc::new(PubsubShared {
				token,
				topics,
				url: options.pubsub_url.clone(),
				ping_interval: options.ping_interval,
				handshake_timeout: options.handshake_timeout,
				transport: options.transport_factory(),
				nonces: options.nonce_source(),
				bridge: PlatformBridge::new(),
				state: Mutex::new(PubsubState {
					phase: PubsubPhase::Idle,
					socket: None,
					next_generation: 0,
					session: 0,
					handshake: None,
				}),
			}),
		})
	}

	pub fn factory(options: &ConnectorOptions) -> Result<Box<dyn Connector>, ConfigError> {
		Ok(Box::new(Self::new(options)?))
	}

	pub fn phase(&self) -> PubsubPhase {
		self.shared.state.lock().phase
	}

	pub fn topics(&self) -> &[String] {
		&self.shared.topics
	}
}

impl Drop for PubsubConnector {
	fn drop(&mut self) {
		if let Some(socket) = self.shared.state.lock().socket.take() {
			socket.shutdown();
		}
	}
}

impl PubsubShared {
	fn set_phase(&self, session: u64, phase: PubsubPhase) {
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

	async fn handshake(
		self: &Arc<Self>,
		session: u64,
		signals: &mut mpsc::UnboundedReceiver<Signal>,
	) -> Result<bool, HandshakeError> {
		let url = Url::parse(&self.url)
			.map_err(|e| HandshakeError::Transport(format!("invalid pubsub url {}: {e}", self.url)))?;
		let link = (self.transport)(url)
			.await
			.map_err(|e| HandshakeError::Transport(format!("{e:#}")))?;
		let generation = self.install(session, link)?;
		let nonce = self.nonces.next_nonce();

		loop {
			match signals.recv().await {
				Some(Signal::Open(g)) if g == generation => {
					let frame = listen_frame(&nonce, &self.topics, self.token.expose()).to_string();
					if let Some(socket) = self.state.lock().socket.as_ref().filter(|s| s.generation == generation) {
						socket.send_text(frame);
					}
					self.set_phase(session, PubsubPhase::AwaitingAck);
					debug!(connector = PUBSUB_NAME, topics = ?self.topics, "listen sent");
				}
				Some(Signal::Response {
					generation: g,
					nonce: got,
					error,
				}) if g == generation => {
					if got != nonce {
						return Err(HandshakeError::NonceMismatch);
					}
					if !error.is_empty() {
						return Err(HandshakeError::Rejected(error));
					}
					return Ok(true);
				}
				Some(Signal::Closed(g)) if g == generation => return Err(HandshakeError::Closed),
				Some(Signal::Cancelled) | None => return Err(HandshakeError::Cancelled),
				Some(_) => {}
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

	fn route_frame(&self, generation: u64, text: &str) {
		metrics::counter!("streamline_pubsub_frames_total").increment(1);

		let (kind, payload) = match demux_frame(text) {
			Ok(v) => v,
			Err(e) => {
				warn!(connector = PUBSUB_NAME, error = %e, "dropping unparseable frame");
				return;
			}
		};

		if kind == "RESPONSE" {
			let field = |name: &str| payload.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
			self.signal(Signal::Response {
				generation,
				nonce: field("nonce"),
				error: field("error"),
			});
		}

		self.bridge.emit(kind, EventPayload::Push(payload));
	}

	fn on_closed(&self, generation: u64, reason: Option<String>) {
		let emit_disconnect = {
			let mut st = self.state.lock();
			if !st.socket.as_ref().is_some_and(|s| s.generation == generation) {
				return;
			}
			if let Some(socket) = st.socket.take() {
				socket.shutdown();
			}

			if let Some(tx) = &st.handshake {
				let _ = tx.send(Signal::Closed(generation));
				false
			} else if st.phase == PubsubPhase::Connected {
				st.phase = PubsubPhase::Idle;
				true
			} else {
				false
			}
		};

		if emit_disconnect {
			warn!(connector = PUBSUB_NAME, reason = ?reason, "pubsub transport closed");
			self.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(PUBSUB_NAME.to_string()));
		}
	}
}

async fn read_loop(shared: Arc<PubsubShared>, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
	while let Some(event) = inbound.recv().await {
		match event {
			TransportEvent::Open => shared.signal(Signal::Open(generation)),
			TransportEvent::Text(frame) => shared.route_frame(generation, &frame),
			TransportEvent::Closed(reason) => {
				shared.on_closed(generation, reason);
				return;
			}
		}
	}
	shared.on_closed(generation, None);
}

async fn keepalive(tx: mpsc::UnboundedSender<TransportCommand>, period: Duration) {
	let mut ticker = tokio::time::interval(period);
	ticker.tick().await;
	loop {
		ticker.tick().await;
		if tx.send(TransportCommand::Text(PING_FRAME.to_string())).is_err() {
			return;
		}
		debug!(connector = PUBSUB_NAME, "keepalive ping sent");
	}
}

#[async_trait]
impl Connector for PubsubConnector {
	fn name(&self) -> &'static str {
		PUBSUB_NAME
	}

	fn bridge(&self) -> &PlatformBridge {
		&self.shared.bridge
	}

	async fn connect(&self) -> Result<bool, HandshakeError> {
		let shared = &self.shared;
		let (tx, mut signals) = mpsc::unbounded_channel();
		let session = {
			let mut st = shared.state.lock();
			if st.phase != PubsubPhase::Idle {
				return Ok(false);
			}
			st.phase = PubsubPhase::Connecting;
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
				Ok(_) => {
					st.phase = PubsubPhase::Connected;
					if !shared.ping_interval.is_zero()
						&& let Some(socket) = st.socket.as_mut()
					{
						socket
							.tasks
							.push(tokio::spawn(keepalive(socket.tx.clone(), shared.ping_interval)));
					}
				}
				Err(_) => {
					st.phase = PubsubPhase::Idle;
					if let Some(socket) = st.socket.take() {
						socket.shutdown();
					}
				}
			}
		}

		match &result {
			Ok(_) => {
				info!(connector = PUBSUB_NAME, topics = ?shared.topics, "pubsub connected");
				shared
					.bridge
					.emit(CONNECT_EVENT, EventPayload::Lifecycle(PUBSUB_NAME.to_string()));
			}
			Err(e) => warn!(connector = PUBSUB_NAME, error = %e, "pubsub handshake failed"),
		}
		result
	}

	async fn disconnect(&self) {
		let (socket, handshake) = {
			let mut st = self.shared.state.lock();
			st.phase = PubsubPhase::Idle;
			st.session += 1;
			(st.socket.take(), st.handshake.take())
		};

		if let Some(tx) = handshake {
			let _ = tx.send(Signal::Cancelled);
		}
		if let Some(socket) = socket {
			socket.shutdown();
			info!(connector = PUBSUB_NAME, "pubsub disconnected");
			self.shared
				.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(PUBSUB_NAME.to_string()));
		}
	}
}
