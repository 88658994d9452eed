#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamline_bridge::Event;
use streamline_platform::{
	BoxFuture, ConnectorOptions, EventPayload, HttpClient, HttpRequest, HttpResponse, SecretString, SequenceNonce,
	TransportCommand, TransportEvent, TransportFactory, TransportLink, UserCredentials,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(2);

/// Test-side end of one in-memory connection.
pub struct FakeSocket {
	pub url: Url,
	pub sent: mpsc::UnboundedReceiver<TransportCommand>,
	pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeSocket {
	pub fn open(&self) {
		let _ = self.events.send(TransportEvent::Open);
	}

	pub fn push(&self, text: impl Into<String>) {
		let _ = self.events.send(TransportEvent::Text(text.into()));
	}

	pub fn close(&self, reason: Option<&str>) {
		let _ = self.events.send(TransportEvent::Closed(reason.map(str::to_string)));
	}

	pub async fn next_command(&mut self) -> TransportCommand {
		timeout(WAIT, self.sent.recv())
			.await
			.expect("command within deadline")
			.expect("connector dropped its sender")
	}

	pub async fn next_text(&mut self) -> String {
		match self.next_command().await {
			TransportCommand::Text(text) => text,
			TransportCommand::Close => panic!("expected text, connector closed the socket"),
		}
	}

	/// Drain until the connector sends `Close` or drops the link.
	pub async fn expect_closed(&mut self) {
		loop {
			match timeout(WAIT, self.sent.recv()).await.expect("close within deadline") {
				Some(TransportCommand::Close) | None => return,
				Some(TransportCommand::Text(_)) => {}
			}
		}
	}
}

/// Factory handing every opened link to the test through the returned receiver.
pub fn fake_transport() -> (TransportFactory, mpsc::UnboundedReceiver<FakeSocket>) {
	let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();

	let factory: TransportFactory = Arc::new(move |url: Url| {
		let sockets_tx = sockets_tx.clone();
		Box::pin(async move {
			let (out_tx, out_rx) = mpsc::unbounded_channel();
			let (in_tx, in_rx) = mpsc::unbounded_channel();
			sockets_tx
				.send(FakeSocket {
					url,
					sent: out_rx,
					events: in_tx,
				})
				.map_err(|_| anyhow::anyhow!("test dropped the socket receiver"))?;
			Ok(TransportLink {
				outbound: out_tx,
				inbound: in_rx,
			})
		}) as BoxFuture<'static, anyhow::Result<TransportLink>>
	});

	(factory, sockets_rx)
}

pub async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<FakeSocket>) -> FakeSocket {
	timeout(WAIT, sockets.recv())
		.await
		.expect("socket within deadline")
		.expect("factory dropped")
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event<EventPayload>>) -> Event<EventPayload> {
	timeout(WAIT, events.recv())
		.await
		.expect("event within deadline")
		.expect("bridge stream closed")
}

/// HTTP client answering from a closure and recording every request.
pub struct ScriptedHttp {
	respond: Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>,
	requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
	pub fn new(respond: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
		Arc::new(Self {
			respond: Box::new(respond),
			requests: Mutex::new(Vec::new()),
		})
	}

	pub fn requests(&self) -> Vec<HttpRequest> {
		self.requests.lock().clone()
	}
}

#[async_trait]
impl HttpClient for ScriptedHttp {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
		let resp = (self.respond)(&request);
		self.requests.lock().push(request);
		Ok(resp)
	}
}

pub fn respond(status: u16, body: &str) -> HttpResponse {
	HttpResponse {
		status,
		status_text: match status {
			200 => "OK",
			202 => "Accepted",
			400 => "Bad Request",
			404 => "Not Found",
			_ => "",
		}
		.to_string(),
		body: body.to_string(),
	}
}

pub fn options(transport: TransportFactory) -> ConnectorOptions {
	let mut options = ConnectorOptions::new();
	options.user = Some(UserCredentials {
		name: Some("bot".into()),
		id: Some("42".into()),
		token: Some(SecretString::new("tok")),
	});
	options.channel = Some("Chan".into());
	options.topics = vec!["whispers".into()];
	options.eventsub_topics = vec!["channel.follow".into(), "channel.cheer".into()];
	options.client_id = Some("cid".into());
	options.transport = Some(transport);
	options.nonces = Some(Arc::new(SequenceNonce::new("n")));
	options
}
