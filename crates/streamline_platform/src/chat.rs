#![forbid(unsafe_code)]

//! Chat connector: IRC-over-WebSocket handshake, line routing and acknowledged sends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamline_bridge::Unsubscribe;
use streamline_protocol::{MessageKind, Parser, split_frame, writer};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use url::Url;

use crate::connector::{Connector, ConnectorOp, SayReceipt};
use crate::error::{ConfigError, HandshakeError, SayError};
use crate::event::{CONNECT_EVENT, DISCONNECT_EVENT, EventPayload, PlatformBridge};
use crate::nonce::NonceSource;
use crate::options::{ConnectorOptions, RetryPolicy};
use crate::SecretString;
use crate::transport::{Socket, TransportCommand, TransportEvent, TransportFactory, TransportLink};

pub const CHAT_NAME: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
	Idle,
	Connecting,
	AwaitingJoin,
	Connected,
	Retrying,
}

/// Reader → pending handshake. Tagged with the socket generation so frames
/// from a torn-down socket are ignored.
#[derive(Debug)]
enum Signal {
	Open(u64),
	Joined(u64, String),
	Notice(u64, String),
	Closed(u64),
	Cancelled,
}

struct PendingSay {
	message: String,
	tx: oneshot::Sender<SayReceipt>,
}

struct ChatState {
	phase: ChatPhase,
	socket: Option<Socket>,
	next_generation: u64,

	/// Bumped by every `connect` and `disconnect`.
	session: u64,

	handshake: Option<mpsc::UnboundedSender<Signal>>,
	pending_says: HashMap<String, PendingSay>,
}

struct ChatShared {
	username: String,
	channel: String,
	token: SecretString,
	parser: Parser,
	url: String,
	join_timeout: Duration,
	retry: RetryPolicy,
	say_timeout: Option<Duration>,
	transport: TransportFactory,
	nonces: Arc<dyn NonceSource>,
	bridge: PlatformBridge,
	state: Mutex<ChatState>,
}

pub struct ChatConnector {
	shared: Arc<ChatShared>,
	pong: Option<Unsubscribe<EventPayload>>,
}

impl ChatConnector {
	pub fn new(options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let user = options.require_user()?;
		let username = user.require_name()?.to_string();
		let token = user.require_token()?.clone();
		let channel = options.channel.clone().ok_or(ConfigError::MissingChannel)?;

		let shared = Arc::new(ChatShared {
			parser: Parser::new(username.clone()),
			username,
			channel,
			token,
			url: options.chat_url.clone(),
			join_timeout: options.chat_timeout,
			retry: options.retry,
			say_timeout: options.say_timeout,
			transport: options.transport_factory(),
			nonces: options.nonce_source(),
			bridge: PlatformBridge::new(),
			state: Mutex::new(ChatState {
				phase: ChatPhase::Idle,
				socket: None,
				next_generation: 0,
				session: 0,
				handshake: None,
				pending_says: HashMap::new(),
			}),
		});

		let weak = Arc::downgrade(&shared);
		let pong = shared.bridge.on("ping", move |_| {
			if let Some(shared) = weak.upgrade() {
				shared.send_line(writer::PONG_LINE.to_string());
			}
		});

		Ok(Self {
			shared,
			pong: Some(pong),
		})
	}

	pub fn factory(options: &ConnectorOptions) -> Result<Box<dyn Connector>, ConfigError> {
		Ok(Box::new(Self::new(options)?))
	}

	pub fn phase(&self) -> ChatPhase {
		self.shared.state.lock().phase
	}

	pub fn channel(&self) -> &str {
		&self.shared.channel
	}
}

impl Drop for ChatConnector {
	fn drop(&mut self) {
		if let Some(pong) = self.pong.take() {
			let _ = pong.unsubscribe();
		}
		if let Some(socket) = self.shared.state.lock().socket.take() {
			socket.shutdown();
		}
	}
}

impl ChatShared {
	fn set_phase(&self, session: u64, phase: ChatPhase) {
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

	fn send_line(&self, line: String) {
		if let Some(socket) = &self.state.lock().socket {
			socket.send_text(line);
		}
	}

	async fn handshake(
		self: &Arc<Self>,
		session: u64,
		signals: &mut mpsc::UnboundedReceiver<Signal>,
	) -> Result<bool, HandshakeError> {
		let url = Url::parse(&self.url).map_err(|e| HandshakeError::Transport(format!("invalid chat url {}: {e}", self.url)))?;
		let mut attempt: u32 = 0;

		loop {
			if !self.retry.allows(attempt) {
				return Err(HandshakeError::RetriesExhausted { attempts: attempt });
			}

			if attempt > 0 {
				metrics::counter!("streamline_chat_handshake_retries_total").increment(1);
				self.set_phase(session, ChatPhase::Retrying);

				let delay = self.retry.delay_for(attempt);
				if !delay.is_zero() {
					debug!(connector = CHAT_NAME, attempt, ?delay, "waiting before handshake restart");
					let deadline = Instant::now() + delay;
					loop {
						tokio::select! {
							_ = sleep_until(deadline) => break,
							sig = signals.recv() => {
								if matches!(sig, Some(Signal::Cancelled) | None) {
									return Err(HandshakeError::Cancelled);
								}
							}
						}
					}
				}
			}

			self.set_phase(session, ChatPhase::Connecting);
			let link = (self.transport)(url.clone())
				.await
				.map_err(|e| HandshakeError::Transport(format!("{e:#}")))?;
			let generation = self.install(session, link)?;

			let mut deadline: Option<Instant> = None;
			let outcome = loop {
				tokio::select! {
					sig = signals.recv() => match sig {
						Some(Signal::Open(g)) if g == generation => {
							self.send_handshake_lines(generation);
							self.set_phase(session, ChatPhase::AwaitingJoin);
							deadline = Some(Instant::now() + self.join_timeout);
						}
						Some(Signal::Joined(g, joined)) if g == generation => {
							if joined.eq_ignore_ascii_case(&self.channel) {
								break Ok(true);
							}
							break Err(HandshakeError::JoinMismatch {
								expected: self.channel.clone(),
								actual: joined,
							});
						}
						Some(Signal::Notice(g, text)) if g == generation => break Err(HandshakeError::Notice(text)),
						Some(Signal::Closed(g)) if g == generation => break Err(HandshakeError::Closed),
						Some(Signal::Cancelled) | None => break Err(HandshakeError::Cancelled),
						Some(_) => {}
					},

					_ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
						break Err(HandshakeError::Timeout);
					}
				}
			};

			match outcome {
				Err(HandshakeError::Timeout) => {
					warn!(connector = CHAT_NAME, channel = %self.channel, attempt, "no join confirmation; restarting handshake");
					self.teardown(generation);
					attempt = attempt.saturating_add(1);
				}
				other => return other,
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
		let socket = Socket {
			generation,
			tx: outbound,
			tasks: vec![reader],
		};
		if let Some(stale) = st.socket.replace(socket) {
			stale.shutdown();
		}
		Ok(generation)
	}

	fn teardown(&self, generation: u64) {
		let mut st = self.state.lock();
		if st.socket.as_ref().is_some_and(|s| s.generation == generation)
			&& let Some(socket) = st.socket.take()
		{
			socket.shutdown();
		}
	}

	fn send_handshake_lines(&self, generation: u64) {
		let st = self.state.lock();
		let Some(socket) = st.socket.as_ref().filter(|s| s.generation == generation) else {
			return;
		};

		let lines = [
			writer::pass_line(self.token.expose()),
			writer::nick_line(&self.username),
			writer::CAP_REQUEST_LINE.to_string(),
			writer::join_line(&self.channel),
		];
		for line in lines {
			socket.send_text(line);
		}
		debug!(connector = CHAT_NAME, channel = %self.channel, generation, "handshake lines sent");
	}

	fn route_line(&self, generation: u64, line: &str) {
		let msg = self.parser.parse(line);
		metrics::counter!("streamline_chat_lines_total").increment(1);

		match &msg.kind {
			MessageKind::Join if msg.nick().is_none_or(|n| n.eq_ignore_ascii_case(&self.username)) => {
				if let Some(channel) = &msg.channel {
					self.signal(Signal::Joined(generation, channel.clone()));
				}
			}
			MessageKind::System if msg.command.as_deref() == Some("NOTICE") => {
				self.signal(Signal::Notice(generation, msg.message.clone().unwrap_or_default()));
			}
			MessageKind::Command(cmd) if cmd == "USERSTATE" => {
				if let Some(tags) = &msg.tags
					&& let Some(nonce) = tags.text("clientNonce")
				{
					let pending = self.state.lock().pending_says.remove(nonce);
					if let Some(pending) = pending {
						let _ = pending.tx.send(SayReceipt {
							tags: tags.clone(),
							message: pending.message,
						});
					}
				}
			}
			_ => {}
		}

		let kind = msg.event_type().to_string();
		self.bridge.emit(kind, EventPayload::Chat(msg));
	}

	fn on_closed(&self, generation: u64, reason: Option<String>) {
		let emit_disconnect = {
			let mut st = self.state.lock();
			if !st.socket.as_ref().is_some_and(|s| s.generation == generation) {
				return;
			}
			st.socket = None;
			st.pending_says.clear();

			if let Some(tx) = &st.handshake {
				let _ = tx.send(Signal::Closed(generation));
				false
			} else if st.phase == ChatPhase::Connected {
				st.phase = ChatPhase::Idle;
				true
			} else {
				false
			}
		};

		if emit_disconnect {
			warn!(connector = CHAT_NAME, reason = ?reason, "chat transport closed");
			self.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(CHAT_NAME.to_string()));
		}
	}
}

async fn read_loop(shared: Arc<ChatShared>, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
	while let Some(event) = inbound.recv().await {
		match event {
			TransportEvent::Open => shared.signal(Signal::Open(generation)),
			TransportEvent::Text(frame) => {
				for line in split_frame(&frame) {
					shared.route_line(generation, line);
				}
			}
			TransportEvent::Closed(reason) => {
				shared.on_closed(generation, reason);
				return;
			}
		}
	}
	shared.on_closed(generation, None);
}

#[async_trait]
impl Connector for ChatConnector {
	fn name(&self) -> &'static str {
		CHAT_NAME
	}

	fn bridge(&self) -> &PlatformBridge {
		&self.shared.bridge
	}

	async fn connect(&self) -> Result<bool, HandshakeError> {
		let shared = &self.shared;
		let (tx, mut signals) = mpsc::unbounded_channel();
		let session = {
			let mut st = shared.state.lock();
			if st.phase != ChatPhase::Idle {
				return Ok(false);
			}
			st.phase = ChatPhase::Connecting;
			st.session += 1;
			st.handshake = Some(tx);
			st.session
		};

		let mut result = shared.handshake(session, &mut signals).await;

		{
			let mut st = shared.state.lock();
			if st.session != session {
				return Err(result.err().unwrap_or(HandshakeError::Cancelled));
			}
			st.handshake = None;
			// the reader may have seen the close right after the confirmation
			if result.is_ok() && st.socket.is_none() {
				result = Err(HandshakeError::Closed);
			}
			match &result {
				Ok(_) => st.phase = ChatPhase::Connected,
				Err(_) => {
					st.phase = ChatPhase::Idle;
					if let Some(socket) = st.socket.take() {
						socket.shutdown();
					}
				}
			}
		}

		match &result {
			Ok(_) => {
				info!(connector = CHAT_NAME, channel = %shared.channel, "chat connected");
				shared
					.bridge
					.emit(CONNECT_EVENT, EventPayload::Lifecycle(CHAT_NAME.to_string()));
			}
			Err(e) => warn!(connector = CHAT_NAME, channel = %shared.channel, error = %e, "chat handshake failed"),
		}
		result
	}

	async fn disconnect(&self) {
		let (socket, handshake) = {
			let mut st = self.shared.state.lock();
			st.phase = ChatPhase::Idle;
			st.session += 1;
			st.pending_says.clear();
			(st.socket.take(), st.handshake.take())
		};

		if let Some(tx) = handshake {
			let _ = tx.send(Signal::Cancelled);
		}
		if let Some(socket) = socket {
			socket.shutdown();
			info!(connector = CHAT_NAME, "chat disconnected");
			self.shared
				.bridge
				.emit(DISCONNECT_EVENT, EventPayload::Lifecycle(CHAT_NAME.to_string()));
		}
	}

	fn ops(&self) -> &'static [ConnectorOp] {
		&[ConnectorOp::Say]
	}

	async fn say(&self, text: &str, reply_to: Option<&str>) -> Result<SayReceipt, SayError> {
		let shared = &self.shared;
		let nonce = shared.nonces.next_nonce();
		let (tx, rx) = oneshot::channel();

		{
			let mut st = shared.state.lock();
			if st.phase != ChatPhase::Connected {
				return Err(SayError::NotConnected);
			}
			let Some(socket) = st.socket.as_ref() else {
				return Err(SayError::NotConnected);
			};
			let line = writer::privmsg_line(&shared.channel, text, &nonce, reply_to);
			if !socket.send_text(line) {
				return Err(SayError::Disconnected);
			}
			st.pending_says.insert(
				nonce.clone(),
				PendingSay {
					message: text.to_string(),
					tx,
				},
			);
		}

		let ack = async { rx.await.map_err(|_| SayError::Disconnected) };
		match shared.say_timeout {
			None => ack.await,
			Some(limit) => match tokio::time::timeout(limit, ack).await {
				Ok(result) => result,
				Err(_) => {
					shared.state.lock().pending_says.remove(&nonce);
					Err(SayError::Timeout)
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::options::UserCredentials;

	fn options() -> ConnectorOptions {
		let mut options = ConnectorOptions::new();
		options.user = Some(UserCredentials {
			name: Some("bot".into()),
			id: None,
			token: Some(SecretString::new("tok")),
		});
		options.channel = Some("Chan".into());
		options
	}

	#[test]
	fn validates_required_fields_in_order() {
		let mut o = options();
		o.user = None;
		assert_eq!(ChatConnector::new(&o).err(), Some(ConfigError::MissingUser));

		let mut o = options();
		if let Some(u) = o.user.as_mut() {
			u.name = None;
		}
		assert_eq!(ChatConnector::new(&o).err(), Some(ConfigError::MissingUserName));

		let mut o = options();
		if let Some(u) = o.user.as_mut() {
			u.token = None;
		}
		assert_eq!(ChatConnector::new(&o).err(), Some(ConfigError::MissingUserToken));

		let mut o = options();
		o.channel = None;
		assert_eq!(ChatConnector::new(&o).err(), Some(ConfigError::MissingChannel));
	}

	#[tokio::test]
	async fn say_without_connection_fails_fast() {
		let chat = ChatConnector::new(&options()).expect("valid options");
		assert_eq!(chat.phase(), ChatPhase::Idle);
		assert_eq!(chat.say("hi", None).await, Err(SayError::NotConnected));
	}

	#[tokio::test]
	async fn disconnect_is_idempotent_when_idle() {
		let chat = ChatConnector::new(&options()).expect("valid options");
		chat.disconnect().await;
		chat.disconnect().await;
		assert_eq!(chat.phase(), ChatPhase::Idle);
	}
}
