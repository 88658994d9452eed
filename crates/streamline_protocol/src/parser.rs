#![forbid(unsafe_code)]

use crate::message::{Message, MessageKind, UserNoticeKind};
use crate::tags::parse_tags;

/// Prefix of replies sent by the chat server itself.
pub const SYSTEM_SOURCE: &str = ":tmi.twitch.tv";

/// Routing class of a raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
	System,
	Keepalive,
	Regular,
}

/// Split a transport frame into trimmed, non-empty lines.
pub fn split_frame(frame: &str) -> impl Iterator<Item = &str> {
	frame.split('\n').map(str::trim).filter(|line| !line.is_empty())
}

/// Line parser bound to the connected user's login.
#[derive(Debug, Clone)]
pub struct Parser {
	username: String,
	user_source: String,
}

impl Parser {
	pub fn new(username: impl Into<String>) -> Self {
		let username = username.into();
		let user_source = format!(":{username}.tmi.twitch.tv");
		Self { username, user_source }
	}

	pub fn username(&self) -> &str {
		&self.username
	}

	pub fn classify(&self, line: &str) -> LineClass {
		if line.starts_with(SYSTEM_SOURCE) || line.starts_with(&self.user_source) {
			return LineClass::System;
		}
		if line.starts_with("PING") {
			return LineClass::Keepalive;
		}
		LineClass::Regular
	}

	/// Parse one non-blank line.
	pub fn parse(&self, line: &str) -> Message {
		match self.classify(line) {
			LineClass::System => self.parse_system(line),
			LineClass::Keepalive => Message::new(MessageKind::Ping),
			LineClass::Regular => {
				let mut msg = parse_regular(line);
				msg.kind = classify_subtype(&msg);
				msg
			}
		}
	}

	fn parse_system(&self, line: &str) -> Message {
		let mut msg = Message::new(MessageKind::System);

		let Some(space) = line.find(' ') else {
			msg.from = Some(line.to_string());
			return msg;
		};
		msg.from = Some(line[..space].to_string());
		let rest = &line[space + 1..];

		if rest.starts_with(|c: char| c.is_ascii_digit()) {
			msg.seq = rest.get(..3).unwrap_or(rest).parse().ok();
			msg.message = Some(rest.get(4..).unwrap_or_default().to_string());
			return msg;
		}

		if !rest.starts_with(self.username.as_str()) {
			match rest.split_once(' ') {
				Some((command, tail)) => {
					msg.command = Some(command.to_string());
					msg.message = Some(tail.to_string());
				}
				None => {
					msg.command = Some(rest.to_string());
					msg.message = Some(String::new());
				}
			}
			return msg;
		}

		msg.message = Some(rest.to_string());
		msg
	}
}

fn section_end(line: &str, from: usize) -> usize {
	line[from..].find(' ').map_or(line.len(), |pos| from + pos)
}

fn parse_regular(line: &str) -> Message {
	let mut msg = Message::new(MessageKind::Command(String::new()));
	let mut command: Option<String> = None;
	let mut index = 0;

	while index < line.len() {
		let end = section_end(line, index);
		let section = &line[index..end];

		match section.as_bytes().first() {
			Some(b'@') => {
				msg.tags = Some(parse_tags(&section[1..]));
			}
			Some(b':') if msg.source.is_none() => {
				msg.source = Some(section.to_string());
			}
			Some(b':') => {
				msg.message = Some(line[index + 1..].to_string());
				break;
			}
			Some(b'#') => {
				msg.channel = Some(section[1..].to_string());
			}
			_ => {
				command = Some(section.to_string());
			}
		}

		index = end + 1;
	}

	msg.command = command;
	msg
}

fn classify_subtype(msg: &Message) -> MessageKind {
	let Some(command) = msg.command.as_deref() else {
		return MessageKind::Command(String::new());
	};
	let tags = msg.tags.as_ref();

	match command {
		"PART" => MessageKind::Part,
		"JOIN" => MessageKind::Join,
		"PRIVMSG" => {
			if tags.is_some_and(|t| t.contains("bits")) {
				MessageKind::Bits
			} else if tags.is_some_and(|t| t.contains("customRewardID")) {
				MessageKind::ChatRedeem
			} else {
				MessageKind::ChatMessage
			}
		}
		"USERNOTICE" => {
			let msg_id = tags.and_then(|t| t.text("msgID"));
			match msg_id.and_then(UserNoticeKind::from_msg_id) {
				Some(kind) => MessageKind::UserNotice(kind),
				None => MessageKind::UnknownUserNotice(msg_id.map(str::to_string)),
			}
		}
		other => MessageKind::Command(other.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tags::TagValue;

	fn parser() -> Parser {
		Parser::new("botname")
	}

	#[test]
	fn classifies_lines() {
		let p = parser();
		assert_eq!(p.classify(":tmi.twitch.tv 001 botname :Welcome, GLHF!"), LineClass::System);
		assert_eq!(
			p.classify(":botname.tmi.twitch.tv 353 botname = #chan :botname"),
			LineClass::System
		);
		assert_eq!(p.classify("PING :tmi.twitch.tv"), LineClass::Keepalive);
		assert_eq!(
			p.classify(":botname!botname@botname.tmi.twitch.tv JOIN #chan"),
			LineClass::Regular
		);
	}

	#[test]
	fn numeric_system_reply() {
		let msg = parser().parse(":tmi.twitch.tv 001 botname :Welcome, GLHF!");
		assert_eq!(msg.kind, MessageKind::System);
		assert_eq!(msg.from.as_deref(), Some(":tmi.twitch.tv"));
		assert_eq!(msg.seq, Some(1));
		assert_eq!(msg.message.as_deref(), Some("botname :Welcome, GLHF!"));
	}

	#[test]
	fn notice_system_reply() {
		let msg = parser().parse(":tmi.twitch.tv NOTICE * :Login authentication failed");
		assert_eq!(msg.kind, MessageKind::System);
		assert_eq!(msg.command.as_deref(), Some("NOTICE"));
		assert_eq!(msg.message.as_deref(), Some("* :Login authentication failed"));
		assert_eq!(msg.seq, None);
	}

	#[test]
	fn own_name_system_reply() {
		let msg = parser().parse(":botname.tmi.twitch.tv botname hello there");
		assert_eq!(msg.kind, MessageKind::System);
		assert_eq!(msg.command, None);
		assert_eq!(msg.message.as_deref(), Some("botname hello there"));
	}

	#[test]
	fn system_reply_without_space() {
		let msg = parser().parse(":tmi.twitch.tv");
		assert_eq!(msg.from.as_deref(), Some(":tmi.twitch.tv"));
		assert_eq!(msg.message, None);
	}

	#[test]
	fn keepalive() {
		let msg = parser().parse("PING :tmi.twitch.tv");
		assert_eq!(msg, Message::new(MessageKind::Ping));
		assert_eq!(msg.event_type(), "ping");
	}

	#[test]
	fn join_and_part() {
		let p = parser();
		let join = p.parse(":someone!someone@someone.tmi.twitch.tv JOIN #chan");
		assert_eq!(join.kind, MessageKind::Join);
		assert_eq!(join.channel.as_deref(), Some("chan"));
		assert_eq!(join.nick(), Some("someone"));

		let part = p.parse(":someone!someone@someone.tmi.twitch.tv PART #chan");
		assert_eq!(part.event_type(), "part");
	}

	#[test]
	fn privmsg_subtypes() {
		let p = parser();
		let base = ":u!u@u.tmi.twitch.tv PRIVMSG #chan :hello world";

		assert_eq!(p.parse(&format!("@bits=10 {base}")).event_type(), "bits");
		assert_eq!(
			p.parse(&format!("@custom-reward-id=abc {base}")).event_type(),
			"chat.redeem"
		);
		assert_eq!(p.parse(&format!("@color=#fff {base}")).event_type(), "chat.message");
		assert_eq!(p.parse(base).event_type(), "chat.message");
	}

	#[test]
	fn trailing_text_keeps_spaces_and_colons() {
		let msg = parser().parse("@color= :u!u@u.tmi.twitch.tv PRIVMSG #chan :a b :c #d");
		assert_eq!(msg.message.as_deref(), Some("a b :c #d"));
		assert_eq!(msg.channel.as_deref(), Some("chan"));
		assert_eq!(msg.command.as_deref(), Some("PRIVMSG"));
	}

	#[test]
	fn usernotice_table() {
		let p = parser();
		let cases = [
			("sub", "sub.new"),
			("resub", "sub.resub"),
			("subgift", "sub.gift"),
			("anonsubgift", "sub.gift.anon"),
			("submysterygift", "sub.gift.mystery"),
			("giftpaidupgrade", "sub.upgrade"),
			("anongiftpaidupgrade", "sub.upgrade.anon"),
			("raid", "raid"),
			("unraid", "unraid"),
			("bitbadgetier", "bits.badge-tier"),
			("rewardgift", "reward"),
		];
		for (msg_id, expected) in cases {
			let line = format!("@msg-id={msg_id} :tmi.twitch.tv USERNOTICE #chan :hi");
			let msg = p.parse(&line);
			assert_eq!(msg.event_type(), expected, "msg-id={msg_id}");
		}
	}

	#[test]
	fn unmapped_usernotice_is_tolerated() {
		let msg = parser().parse("@msg-id=announcement :tmi.twitch.tv USERNOTICE #chan :hi");
		assert_eq!(
			msg.kind,
			MessageKind::UnknownUserNotice(Some("announcement".to_string()))
		);
		assert_eq!(msg.event_type(), "unknown");
	}

	#[test]
	fn unknown_command_passes_through() {
		let msg = parser().parse("@client-nonce=n1;mod=0 :tmi.twitch.tv USERSTATE #chan");
		assert_eq!(msg.event_type(), "USERSTATE");
		let tags = msg.tags.expect("tags");
		assert_eq!(tags.text("clientNonce"), Some("n1"));
		assert_eq!(tags.get("mod"), Some(&TagValue::Bool(false)));
	}

	#[test]
	fn split_frame_drops_blank_lines() {
		let lines: Vec<&str> = split_frame("PING :a\r\n\r\n  \n:tmi.twitch.tv 001 x :y\r\n").collect();
		assert_eq!(lines, vec!["PING :a", ":tmi.twitch.tv 001 x :y"]);
	}
}
