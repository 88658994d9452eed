#![forbid(unsafe_code)]

//! Chat line codec: tag decoding, line classification, message parsing and
//! the outbound lines a client writes. No I/O.

pub mod message;
pub mod parser;
pub mod tags;
pub mod writer;

pub use message::{Message, MessageKind, UserNoticeKind};
pub use parser::{LineClass, Parser, SYSTEM_SOURCE, split_frame};
pub use tags::{KnownTag, TagValue, Tags, camel_key, parse_tags};
