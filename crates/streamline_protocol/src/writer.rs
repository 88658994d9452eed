#![forbid(unsafe_code)]

//! Outbound chat lines.

/// Capability request sent during the handshake.
pub const CAP_REQUEST_LINE: &str = "CAP REQ :twitch.tv/membership twitch.tv/tags twitch.tv/commands";

/// Reply to a server keepalive.
pub const PONG_LINE: &str = "PONG :tmi.twitch.tv";

pub fn pass_line(token: &str) -> String {
	format!("PASS oauth:{token}")
}

pub fn nick_line(name: &str) -> String {
	format!("NICK {name}")
}

pub fn join_line(channel: &str) -> String {
	format!("JOIN #{}", channel.to_lowercase())
}

/// `PRIVMSG` carrying a client nonce and an optional reply target.
pub fn privmsg_line(channel: &str, text: &str, nonce: &str, reply_to: Option<&str>) -> String {
	let mut tags = format!("@client-nonce={nonce}");
	if let Some(parent) = reply_to {
		tags.push_str(";reply-parent-msg-id=");
		tags.push_str(parent);
	}
	format!("{tags} PRIVMSG #{channel} :{text}")
}
