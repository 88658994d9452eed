#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;
use url::Url;

use crate::BoxFuture;

/// Transport → connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
	Open,
	Text(String),
	Closed(Option<String>),
}

/// Connector → transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
	Text(String),
	Close,
}

/// Both halves of one framed text connection.
#[derive(Debug)]
pub struct TransportLink {
	pub outbound: mpsc::UnboundedSender<TransportCommand>,
	pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Connector-owned half of a live link plus the tasks serving it.
pub(crate) struct Socket {
	pub(crate) generation: u64,
	pub(crate) tx: mpsc::UnboundedSender<TransportCommand>,
	pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl Socket {
	pub(crate) fn send_text(&self, text: String) -> bool {
		self.tx.send(TransportCommand::Text(text)).is_ok()
	}

	pub(crate) fn shutdown(self) {
		let _ = self.tx.send(TransportCommand::Close);
		for task in self.tasks {
			task.abort();
		}
	}
}

pub type TransportFactory = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TransportLink>> + Send + Sync>;

/// Default factory backed by `tokio-tungstenite`.
pub fn websocket_transport() -> TransportFactory {
	Arc::new(|url: Url| Box::pin(open_websocket(url)) as BoxFuture<'static, anyhow::Result<TransportLink>>)
}

async fn open_websocket(url: Url) -> anyhow::Result<TransportLink> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;

	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TransportCommand>();
	let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
	let _ = in_tx.send(TransportEvent::Open);

	tokio::spawn(async move {
		let (mut sink, mut stream) = ws.split();

		let reason = loop {
			tokio::select! {
				cmd = out_rx.recv() => match cmd {
					Some(TransportCommand::Text(text)) => {
						if let Err(e) = sink.send(Message::Text(text.into())).await {
							break Some(format!("ws write: {e}"));
						}
					}
					Some(TransportCommand::Close) | None => {
						let _ = sink.close().await;
						break None;
					}
				},

				msg = stream.next() => match msg {
					Some(Ok(Message::Text(t))) => {
						let _ = in_tx.send(TransportEvent::Text(t.to_string()));
					}
					Some(Ok(Message::Ping(p))) => {
						let _ = sink.send(Message::Pong(p)).await;
					}
					Some(Ok(Message::Close(frame))) => {
						break frame.map(|f| f.reason.as_str().to_string());
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => break Some(format!("ws read: {e}")),
					None => break None,
				},
			}
		};

		debug!(url = %url, reason = ?reason, "websocket transport closed");
		let _ = in_tx.send(TransportEvent::Closed(reason));
	});

	Ok(TransportLink {
		outbound: out_tx,
		inbound: in_rx,
	})
}
