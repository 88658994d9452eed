#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Badge entry that marks the channel owner.
pub const BROADCASTER_BADGE: &str = "broadcaster/1";
/// Badge entry that marks a VIP.
pub const VIP_BADGE: &str = "vip/1";

/// Typed value of a single tag.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum TagValue {
	Int(i64),
	Bool(bool),
	Text(String),
	List(Vec<String>),
	/// Segment had no `=`.
	Missing,
}

impl TagValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Text(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			Self::Int(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Bool(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_list(&self) -> Option<&[String]> {
		match self {
			Self::List(v) => Some(v),
			_ => None,
		}
	}
}

/// Tags with a coercion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownTag {
	Bits,
	TmiSentTs,
	Badges,
	Mod,
	Subscriber,
	Turbo,
	FirstMsg,
}

impl KnownTag {
	/// Look up a camel-cased key.
	pub fn from_key(key: &str) -> Option<Self> {
		match key {
			"bits" => Some(Self::Bits),
			"tmiSentTs" => Some(Self::TmiSentTs),
			"badges" => Some(Self::Badges),
			"mod" => Some(Self::Mod),
			"subscriber" => Some(Self::Subscriber),
			"turbo" => Some(Self::Turbo),
			"firstMsg" => Some(Self::FirstMsg),
			_ => None,
		}
	}

	/// Coerce a raw value. Integers that fail to parse stay as text.
	pub fn coerce(self, raw: &str) -> TagValue {
		match self {
			Self::Bits | Self::TmiSentTs => match raw.parse::<i64>() {
				Ok(v) => TagValue::Int(v),
				Err(_) => TagValue::Text(raw.to_string()),
			},
			Self::Badges => TagValue::List(raw.split(',').map(str::to_string).collect()),
			Self::Mod | Self::Subscriber | Self::Turbo | Self::FirstMsg => TagValue::Bool(raw == "1"),
		}
	}
}

/// Decoded tag block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tags {
	pub values: BTreeMap<String, TagValue>,

	/// `None` when there is no badge list.
	pub broadcaster: Option<bool>,

	/// `None` when there is no badge list.
	pub vip: Option<bool>,
}

impl Tags {
	pub fn get(&self, key: &str) -> Option<&TagValue> {
		self.values.get(key)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.values.contains_key(key)
	}

	pub fn text(&self, key: &str) -> Option<&str> {
		self.get(key).and_then(TagValue::as_str)
	}

	pub fn int(&self, key: &str) -> Option<i64> {
		self.get(key).and_then(TagValue::as_int)
	}

	pub fn bool(&self, key: &str) -> Option<bool> {
		self.get(key).and_then(TagValue::as_bool)
	}

	pub fn list(&self, key: &str) -> Option<&[String]> {
		self.get(key).and_then(TagValue::as_list)
	}

	pub fn badges(&self) -> Option<&[String]> {
		self.list("badges")
	}
}

/// Convert a hyphenated tag name to camel form.
///
/// `-id` collapses to `ID`; any other `-x` collapses to `X`.
pub fn camel_key(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	let mut rest = name;

	while let Some(pos) = rest.find('-') {
		out.push_str(&rest[..pos]);
		let after = &rest[pos + 1..];

		if let Some(tail) = after.strip_prefix("id") {
			out.push_str("ID");
			rest = tail;
			continue;
		}

		let mut chars = after.chars();
		match chars.next() {
			Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
				out.extend(c.to_uppercase());
				rest = chars.as_str();
			}
			_ => {
				out.push('-');
				rest = after;
			}
		}
	}

	out.push_str(rest);
	out
}

/// Decode a tag block (without the leading `@`).
pub fn parse_tags(block: &str) -> Tags {
	let mut values = BTreeMap::new();

	for segment in block.split(';') {
		let (name, raw) = match segment.split_once('=') {
			Some((name, raw)) => (name, Some(raw)),
			None => (segment, None),
		};

		let key = camel_key(name);
		let value = match raw {
			None => TagValue::Missing,
			Some(raw) => match KnownTag::from_key(&key) {
				Some(known) => known.coerce(raw),
				None => TagValue::Text(raw.to_string()),
			},
		};
		values.insert(key, value);
	}

	let badges = values.get("badges").and_then(TagValue::as_list);
	let broadcaster = badges.map(|b| b.iter().any(|v| v == BROADCASTER_BADGE));
	let vip = badges.map(|b| b.iter().any(|v| v == VIP_BADGE));

	Tags {
		values,
		broadcaster,
		vip,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn camel_key_handles_id_and_single_chars() {
		assert_eq!(camel_key("tmi-sent-ts"), "tmiSentTs");
		assert_eq!(camel_key("msg-id"), "msgID");
		assert_eq!(camel_key("custom-reward-id"), "customRewardID");
		assert_eq!(camel_key("reply-parent-msg-id"), "replyParentMsgID");
		assert_eq!(camel_key("first-msg"), "firstMsg");
		assert_eq!(camel_key("client-nonce"), "clientNonce");
		assert_eq!(camel_key("badges"), "badges");
	}

	#[test]
	fn camel_key_keeps_trailing_hyphen() {
		assert_eq!(camel_key("odd-"), "odd-");
	}

	#[test]
	fn known_keys_are_coerced() {
		let tags = parse_tags("bits=5;mod=1;subscriber=0;turbo=1;first-msg=0;tmi-sent-ts=1000");
		assert_eq!(tags.int("bits"), Some(5));
		assert_eq!(tags.bool("mod"), Some(true));
		assert_eq!(tags.bool("subscriber"), Some(false));
		assert_eq!(tags.bool("turbo"), Some(true));
		assert_eq!(tags.bool("firstMsg"), Some(false));
		assert_eq!(tags.int("tmiSentTs"), Some(1000));
	}

	#[test]
	fn badges_derive_flags() {
		let tags = parse_tags("badges=broadcaster/1,vip/1");
		assert_eq!(
			tags.badges(),
			Some(&["broadcaster/1".to_string(), "vip/1".to_string()][..])
		);
		assert_eq!(tags.broadcaster, Some(true));
		assert_eq!(tags.vip, Some(true));

		let tags = parse_tags("badges=subscriber/12");
		assert_eq!(tags.broadcaster, Some(false));
		assert_eq!(tags.vip, Some(false));
	}

	#[test]
	fn flags_are_none_without_badges() {
		let tags = parse_tags("color=#FF0000;display-name=Someone");
		assert_eq!(tags.broadcaster, None);
		assert_eq!(tags.vip, None);
		assert_eq!(tags.text("displayName"), Some("Someone"));
	}

	#[test]
	fn malformed_segment_is_missing_not_fatal() {
		let tags = parse_tags("emote-only;room-id=42");
		assert_eq!(tags.get("emoteOnly"), Some(&TagValue::Missing));
		assert_eq!(tags.text("roomID"), Some("42"));
	}

	#[test]
	fn bad_integer_stays_text() {
		let tags = parse_tags("bits=lots");
		assert_eq!(tags.text("bits"), Some("lots"));
	}

	#[test]
	fn value_may_contain_equals() {
		let tags = parse_tags("system-msg=a=b");
		assert_eq!(tags.text("systemMsg"), Some("a=b"));
	}
}
