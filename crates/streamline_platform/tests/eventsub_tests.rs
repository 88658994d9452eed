#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{ScriptedHttp, fake_transport, next_event, next_socket, options, respond};
use serde_json::{Value, json};
use streamline_platform::{
	CONNECT_EVENT, Connector, EventSubConnector, EventSubPhase, HandshakeError, HttpClient, HttpMethod, HttpRequest,
	HttpResponse,
};
use tokio::sync::Semaphore;

fn welcome(session_id: &str) -> String {
	json!({
		"metadata": { "message_id": "m1", "message_type": "session_welcome" },
		"payload": { "session": { "id": session_id, "status": "connected" } }
	})
	.to_string()
}

fn spawn_connect(eventsub: &Arc<EventSubConnector>) -> tokio::task::JoinHandle<Result<bool, HandshakeError>> {
	let eventsub = Arc::clone(eventsub);
	tokio::spawn(async move { eventsub.connect().await })
}

async fn settle(task: tokio::task::JoinHandle<Result<bool, HandshakeError>>) -> Result<bool, HandshakeError> {
	tokio::time::timeout(common::WAIT, task)
		.await
		.expect("connect settles")
		.expect("connect task")
}

#[tokio::test]
async fn welcome_creates_subscriptions_then_connects() {
	let (transport, mut sockets) = fake_transport();
	let http = ScriptedHttp::new(|_| respond(202, r#"{"data":[]}"#));
	let mut o = options(transport);
	o.http = Some(http.clone());
	let eventsub = Arc::new(EventSubConnector::new(&o).expect("eventsub"));
	let (_sub, mut connects) = eventsub.bridge().stream(CONNECT_EVENT);
	let (_ws, mut opened) = eventsub.bridge().stream("eventsub.ws-connect");

	let task = spawn_connect(&eventsub);
	let socket = next_socket(&mut sockets).await;
	assert_eq!(socket.url.as_str(), "wss://eventsub-beta.wss.twitch.tv/ws");
	socket.open();
	next_event(&mut opened).await;
	socket.push(welcome("sess-1"));

	assert_eq!(settle(task).await, Ok(true));
	assert_eq!(eventsub.phase(), EventSubPhase::Connected);
	assert_eq!(eventsub.session_id().as_deref(), Some("sess-1"));
	assert_eq!(next_event(&mut connects).await.data.connector_name(), Some("eventsub"));

	let requests = http.requests();
	assert_eq!(requests.len(), 2);
	for req in &requests {
		assert_eq!(req.method, HttpMethod::Post);
		assert_eq!(req.url, "https://api.twitch.tv/helix/eventsub/subscriptions");
		assert_eq!(req.header("authorization"), Some("Bearer tok"));
		assert_eq!(req.header("Client-Id"), Some("cid"));
		assert_eq!(req.header("Content-Type"), Some("application/json"));
	}

	let bodies: Vec<Value> = requests
		.iter()
		.map(|r| serde_json::from_str(r.body.as_deref().expect("body")).expect("json body"))
		.collect();
	assert_eq!(
		bodies[0],
		json!({
			"type": "channel.follow",
			"version": "2",
			"condition": { "broadcaster_user_id": "42", "moderator_user_id": "42" },
			"transport": { "method": "websocket", "session_id": "sess-1" }
		})
	);
	assert_eq!(bodies[1]["type"], "channel.cheer");
	assert_eq!(bodies[1]["version"], "1");
}

#[tokio::test]
async fn failed_subscription_is_reported_and_connect_still_succeeds() {
	let (transport, mut sockets) = fake_transport();
	let http = ScriptedHttp::new(|req| {
		if req.body.as_deref().is_some_and(|b| b.contains("channel.cheer")) {
			respond(400, r#"{"error":"Bad Request"}"#)
		} else {
			respond(202, r#"{"data":[]}"#)
		}
	});
	let mut o = options(transport);
	o.http = Some(http.clone());
	let eventsub = Arc::new(EventSubConnector::new(&o).expect("eventsub"));
	let (_sub, mut failures) = eventsub.bridge().stream("eventsub.subscribe-failed");

	let task = spawn_connect(&eventsub);
	let socket = next_socket(&mut sockets).await;
	socket.open();
	socket.push(welcome("sess-2"));

	assert_eq!(settle(task).await, Ok(true));
	let ev = next_event(&mut failures).await;
	assert_eq!(ev.data.as_json().and_then(|v| v.get("type")), Some(&json!("channel.cheer")));
}

#[tokio::test]
async fn notifications_are_published_under_their_subscription_type() {
	let (transport, mut sockets) = fake_transport();
	let mut o = options(transport);
	o.http = Some(ScriptedHttp::new(|_| respond(202, "{}")));
	let eventsub = Arc::new(EventSubConnector::new(&o).expect("eventsub"));
	let (_sub, mut events) = eventsub.bridge().stream("channel.*");
	let (_ka, mut keepalives) = eventsub.bridge().stream("eventsub.keepalive");
	let (_rv, mut revocations) = eventsub.bridge().stream("eventsub.revocation");

	let task = spawn_connect(&eventsub);
	let socket = next_socket(&mut sockets).await;
	socket.open();
	socket.push(welcome("sess-3"));
	assert_eq!(settle(task).await, Ok(true));

	socket.push(
		json!({
			"metadata": { "message_type": "notification", "subscription_type": "channel.follow" },
			"payload": { "subscription": { "id": "s" }, "event": { "user_login": "fan" } }
		})
		.to_string(),
	);
	let ev = next_event(&mut events).await;
	assert_eq!(ev.kind, "channel.follow");
	assert_eq!(ev.data.as_json(), Some(&json!({ "user_login": "fan" })));

	socket.push(json!({ "metadata": { "message_type": "session_keepalive" }, "payload": {} }).to_string());
	next_event(&mut keepalives).await;

	socket.push(json!({ "metadata": { "message_type": "revocation" }, "payload": { "status": "gone" } }).to_string());
	let ev = next_event(&mut revocations).await;
	assert_eq!(ev.data.as_json(), Some(&json!({ "status": "gone" })));
}

#[tokio::test]
async fn disconnect_before_welcome_cancels() {
	let (transport, mut sockets) = fake_transport();
	let mut o = options(transport);
	o.http = Some(ScriptedHttp::new(|_| respond(202, "{}")));
	let eventsub = Arc::new(EventSubConnector::new(&o).expect("eventsub"));

	let task = spawn_connect(&eventsub);
	let mut socket = next_socket(&mut sockets).await;
	socket.open();

	eventsub.disconnect().await;
	assert_eq!(settle(task).await, Err(HandshakeError::Cancelled));
	socket.expect_closed().await;
	assert_eq!(eventsub.phase(), EventSubPhase::Idle);
}

#[test]
fn construction_requires_client_id_and_topics() {
	let (transport, _sockets) = fake_transport();
	let mut o = options(transport);
	o.http = Some(ScriptedHttp::new(|_| respond(202, "{}")));

	let mut no_client = o.clone();
	no_client.client_id = None;
	assert_eq!(
		EventSubConnector::new(&no_client).err().map(|e| e.to_string()),
		Some("Invalid config: client id not provided".to_string())
	);

	let mut no_topics = o;
	no_topics.eventsub_topics.clear();
	assert_eq!(
		EventSubConnector::new(&no_topics).err().map(|e| e.to_string()),
		Some("Invalid config: topics not provided".to_string())
	);
}

/// Holds every request until the test releases permits.
struct HeldHttp {
	gate: Semaphore,
}

#[async_trait]
impl HttpClient for HeldHttp {
	async fn send(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
		self.gate.acquire().await?.forget();
		Ok(respond(202, r#"{"data":[]}"#))
	}
}

#[tokio::test]
async fn close_while_subscribing_fails_connect_and_allows_reconnect() {
	let (transport, mut sockets) = fake_transport();
	let http = Arc::new(HeldHttp { gate: Semaphore::new(0) });
	let mut o = options(transport);
	o.http = Some(http.clone());
	let eventsub = Arc::new(EventSubConnector::new(&o).expect("eventsub"));
	let (_sub, mut connects) = eventsub.bridge().stream(CONNECT_EVENT);

	let task = spawn_connect(&eventsub);
	let socket = next_socket(&mut sockets).await;
	socket.open();
	socket.push(welcome("sess-1"));
	socket.close(None);

	assert_eq!(settle(task).await, Err(HandshakeError::Closed));
	assert_eq!(eventsub.phase(), EventSubPhase::Idle);
	assert_eq!(eventsub.session_id(), None);
	assert!(connects.try_recv().is_err(), "no connect event for a dropped session");

	http.gate.add_permits(8);
	let task = spawn_connect(&eventsub);
	let socket = next_socket(&mut sockets).await;
	socket.open();
	socket.push(welcome("sess-2"));
	assert_eq!(settle(task).await, Ok(true));
	assert_eq!(eventsub.phase(), EventSubPhase::Connected);
	assert_eq!(eventsub.session_id().as_deref(), Some("sess-2"));
}
