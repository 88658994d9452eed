#![forbid(unsafe_code)]

use crate::tags::Tags;

/// `USERNOTICE` subtypes keyed by the `msgID` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserNoticeKind {
	SubNew,
	SubResub,
	SubGift,
	SubGiftAnon,
	SubGiftMystery,
	SubUpgrade,
	SubUpgradeAnon,
	Raid,
	Unraid,
	BitsBadgeTier,
	Reward,
}

impl UserNoticeKind {
	pub fn from_msg_id(msg_id: &str) -> Option<Self> {
		match msg_id {
			"sub" => Some(Self::SubNew),
			"resub" => Some(Self::SubResub),
			"subgift" => Some(Self::SubGift),
			"anonsubgift" => Some(Self::SubGiftAnon),
			"submysterygift" => Some(Self::SubGiftMystery),
			"giftpaidupgrade" => Some(Self::SubUpgrade),
			"anongiftpaidupgrade" => Some(Self::SubUpgradeAnon),
			"raid" => Some(Self::Raid),
			"unraid" => Some(Self::Unraid),
			"bitbadgetier" => Some(Self::BitsBadgeTier),
			"rewardgift" => Some(Self::Reward),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::SubNew => "sub.new",
			Self::SubResub => "sub.resub",
			Self::SubGift => "sub.gift",
			Self::SubGiftAnon => "sub.gift.anon",
			Self::SubGiftMystery => "sub.gift.mystery",
			Self::SubUpgrade => "sub.upgrade",
			Self::SubUpgradeAnon => "sub.upgrade.anon",
			Self::Raid => "raid",
			Self::Unraid => "unraid",
			Self::BitsBadgeTier => "bits.badge-tier",
			Self::Reward => "reward",
		}
	}
}

/// Dispatch classification of a parsed line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
	/// Reply from the server itself (numeric or notice style).
	System,
	/// Server keepalive.
	Ping,
	Join,
	Part,
	ChatMessage,
	ChatRedeem,
	Bits,
	UserNotice(UserNoticeKind),
	/// `USERNOTICE` with a `msgID` outside the known table (or none at all).
	UnknownUserNotice(Option<String>),
	/// Any other command, passed through verbatim.
	Command(String),
}

impl MessageKind {
	/// Dotted event type used as the bridge key.
	pub fn event_type(&self) -> &str {
		match self {
			Self::System => "system",
			Self::Ping => "ping",
			Self::Join => "join",
			Self::Part => "part",
			Self::ChatMessage => "chat.message",
			Self::ChatRedeem => "chat.redeem",
			Self::Bits => "bits",
			Self::UserNotice(kind) => kind.as_str(),
			Self::UnknownUserNotice(_) => "unknown",
			Self::Command(cmd) if cmd.is_empty() => "unknown",
			Self::Command(cmd) => cmd,
		}
	}
}

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub kind: MessageKind,

	/// Sender prefix of a system reply.
	pub from: Option<String>,

	pub command: Option<String>,

	/// Channel name without the leading `#`.
	pub channel: Option<String>,

	pub tags: Option<Tags>,

	/// Trailing text.
	pub message: Option<String>,

	/// Numeric reply code of a system reply.
	pub seq: Option<u16>,

	/// Raw `:nick!user@host` prefix of a regular line.
	pub source: Option<String>,
}

impl Message {
	pub fn new(kind: MessageKind) -> Self {
		Self {
			kind,
			from: None,
			command: None,
			channel: None,
			tags: None,
			message: None,
			seq: None,
			source: None,
		}
	}

	pub fn event_type(&self) -> &str {
		self.kind.event_type()
	}

	/// Login name from the `:nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let source = self.source.as_deref()?.strip_prefix(':')?;
		Some(source.split_once('!').map_or(source, |(nick, _)| nick))
	}
}
