#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Helix, HelixError, HelixRequest};
use crate::http::HttpMethod;

const POLLS_PATH: &str = "/polls";

/// Target status when ending a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
	Terminated,
	Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPollChoice {
	pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPoll {
	pub title: String,
	pub choices: Vec<NewPollChoice>,
	/// Seconds.
	pub duration: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channel_points_voting_enabled: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channel_points_per_vote: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollChoice {
	pub id: String,
	pub title: String,
	#[serde(default)]
	pub votes: u64,
	#[serde(default)]
	pub channel_points_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Poll {
	pub id: String,
	#[serde(default)]
	pub broadcaster_id: String,
	pub title: String,
	#[serde(default)]
	pub choices: Vec<PollChoice>,
	#[serde(default)]
	pub status: String,
	#[serde(default)]
	pub duration: u32,
	#[serde(default)]
	pub started_at: Option<String>,
	#[serde(default)]
	pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Pagination {
	#[serde(default)]
	pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelixPage<T> {
	pub data: Vec<T>,
	#[serde(default)]
	pub pagination: Pagination,
}

impl<T> HelixPage<T> {
	fn into_first(self) -> Result<T, HelixError> {
		self.data.into_iter().next().ok_or(HelixError::Empty)
	}
}

/// Poll endpoints scoped to the configured broadcaster.
#[derive(Debug, Clone, Copy)]
pub struct Polls<'a> {
	helix: &'a Helix,
}

impl<'a> Polls<'a> {
	pub(super) fn new(helix: &'a Helix) -> Self {
		Self { helix }
	}

	pub async fn find(&self, id: &str) -> Result<Poll, HelixError> {
		let req = HelixRequest::get(POLLS_PATH)
			.param("id", Some(id))
			.param("broadcaster_id", Some(self.helix.user_id()));
		self.helix.request::<HelixPage<Poll>>(req).await?.into_first()
	}

	pub async fn list(&self, after: Option<&str>, first: Option<u32>) -> Result<HelixPage<Poll>, HelixError> {
		let req = HelixRequest::get(POLLS_PATH)
			.param("broadcaster_id", Some(self.helix.user_id()))
			.param("after", after)
			.param("first", first.map(|n| n.to_string()));
		self.helix.request(req).await
	}

	pub async fn create(&self, poll: &NewPoll) -> Result<Poll, HelixError> {
		let mut body = serde_json::to_value(poll).map_err(|e| HelixError::Decode(e.into()))?;
		if let Value::Object(map) = &mut body {
			map.insert("broadcaster_id".into(), Value::String(self.helix.user_id().to_string()));
		}
		let req = HelixRequest::get(POLLS_PATH).body(body);
		self.helix.request::<HelixPage<Poll>>(req).await?.into_first()
	}

	pub async fn end(&self, id: &str, status: PollStatus) -> Result<Poll, HelixError> {
		let req = HelixRequest::get(POLLS_PATH)
			.body(json!({
				"status": status,
				"id": id,
				"broadcaster_id": self.helix.user_id(),
			}))
			.method(HttpMethod::Patch);
		self.helix.request::<HelixPage<Poll>>(req).await?.into_first()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_serializes_screaming() {
		assert_eq!(serde_json::to_value(PollStatus::Terminated).expect("encode"), json!("TERMINATED"));
		assert_eq!(serde_json::to_value(PollStatus::Archived).expect("encode"), json!("ARCHIVED"));
	}

	#[test]
	fn empty_page_has_no_first() {
		let page: HelixPage<Poll> = serde_json::from_str(r#"{"data":[]}"#).expect("decode");
		assert!(matches!(page.into_first(), Err(HelixError::Empty)));
	}
}
