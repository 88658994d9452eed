#![forbid(unsafe_code)]

//! Thin REST helper. No retries; non-2xx responses surface as [`HelixError::Status`].

mod polls;

pub use polls::{HelixPage, NewPoll, NewPollChoice, Pagination, Poll, PollChoice, PollStatus, Polls};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::SecretString;
use crate::error::ConfigError;
use crate::http::{HttpClient, HttpMethod, HttpRequest};
use crate::options::ConnectorOptions;

#[derive(Debug, thiserror::Error)]
pub enum HelixError {
	#[error("{status}: {status_text}")]
	Status { status: u16, status_text: String },

	#[error("helix transport: {0:#}")]
	Transport(anyhow::Error),

	#[error("helix decode: {0:#}")]
	Decode(anyhow::Error),

	#[error("helix response carried no data")]
	Empty,

	#[error(transparent)]
	Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelixRequest {
	/// Path below the base url, e.g. `/polls`.
	pub path: String,

	/// `None` values are dropped from the query string.
	pub params: Vec<(String, Option<String>)>,

	pub body: Option<Value>,

	/// Defaults to `POST` with a body, `GET` without.
	pub method: Option<HttpMethod>,
}

impl HelixRequest {
	pub fn get(path: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			..Self::default()
		}
	}

	pub fn param(mut self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
		self.params.push((name.into(), value.map(Into::into)));
		self
	}

	pub fn body(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}

	pub fn method(mut self, method: HttpMethod) -> Self {
		self.method = Some(method);
		self
	}

	pub fn effective_method(&self) -> HttpMethod {
		match (self.method, &self.body) {
			(Some(m), _) => m,
			(None, Some(_)) => HttpMethod::Post,
			(None, None) => HttpMethod::Get,
		}
	}

	pub fn query_string(&self) -> String {
		self.params
			.iter()
			.filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))))
			.collect::<Vec<_>>()
			.join("&")
	}
}

#[derive(Clone)]
pub struct Helix {
	http: Arc<dyn HttpClient>,
	base_url: String,
	client_id: String,
	token: SecretString,
	user_id: String,
}

impl std::fmt::Debug for Helix {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Helix")
			.field("base_url", &self.base_url)
			.field("client_id", &self.client_id)
			.field("user_id", &self.user_id)
			.finish_non_exhaustive()
	}
}

impl Helix {
	pub fn new(options: &ConnectorOptions) -> Result<Self, ConfigError> {
		let user = options.require_user()?;
		let user_id = user.require_id()?.to_string();
		let token = user.require_token()?.clone();
		let client_id = options.client_id.clone().ok_or(ConfigError::MissingClientId)?;

		Ok(Self {
			http: options.http_client()?,
			base_url: options.helix_base_url.trim_end_matches('/').to_string(),
			client_id,
			token,
			user_id,
		})
	}

	pub fn user_id(&self) -> &str {
		&self.user_id
	}

	pub fn polls(&self) -> Polls<'_> {
		Polls::new(self)
	}

	pub fn url_for(&self, request: &HelixRequest) -> String {
		let query = request.query_string();
		if query.is_empty() {
			format!("{}{}", self.base_url, request.path)
		} else {
			format!("{}{}?{query}", self.base_url, request.path)
		}
	}

	pub async fn request<T: DeserializeOwned>(&self, request: HelixRequest) -> Result<T, HelixError> {
		let method = request.effective_method();
		let url = self.url_for(&request);
		let body = match &request.body {
			Some(b) => Some(serde_json::to_string(b).map_err(|e| HelixError::Decode(e.into()))?),
			None => None,
		};

		debug!(method = %method, path = %request.path, "helix request");
		let resp = self
			.http
			.send(HttpRequest {
				method,
				url,
				headers: vec![
					("Client-Id".to_string(), self.client_id.clone()),
					("Authorization".to_string(), format!("Bearer {}", self.token.expose())),
					("Content-Type".to_string(), "application/json".to_string()),
				],
				body,
			})
			.await
			.map_err(HelixError::Transport)?;

		if !resp.ok() {
			return Err(HelixError::Status {
				status: resp.status,
				status_text: resp.status_text,
			});
		}
		resp.json().map_err(HelixError::Decode)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_drops_missing_params() {
		let req = HelixRequest::get("/polls")
			.param("broadcaster_id", Some("42"))
			.param("after", None::<String>)
			.param("first", Some("a b"));
		assert_eq!(req.query_string(), "broadcaster_id=42&first=a%20b");
	}

	#[test]
	fn method_follows_body_unless_overridden() {
		assert_eq!(HelixRequest::get("/polls").effective_method(), HttpMethod::Get);
		let post = HelixRequest::get("/polls").body(serde_json::json!({}));
		assert_eq!(post.effective_method(), HttpMethod::Post);
		assert_eq!(post.method(HttpMethod::Patch).effective_method(), HttpMethod::Patch);
	}

	#[test]
	fn url_has_no_dangling_question_mark() {
		let mut options = ConnectorOptions::new();
		options.user = Some(crate::UserCredentials {
			name: None,
			id: Some("42".into()),
			token: Some(SecretString::new("t")),
		});
		options.client_id = Some("cid".into());
		options.helix_base_url = "https://api.example/helix/".into();
		let helix = Helix::new(&options).expect("helix");

		assert_eq!(helix.url_for(&HelixRequest::get("/polls")), "https://api.example/helix/polls");
		assert_eq!(
			helix.url_for(&HelixRequest::get("/polls").param("after", None::<String>)),
			"https://api.example/helix/polls"
		);
		assert_eq!(
			helix.url_for(&HelixRequest::get("/polls").param("id", Some("p1"))),
			"https://api.example/helix/polls?id=p1"
		);
	}

	#[test]
	fn status_error_text() {
		let err = HelixError::Status {
			status: 404,
			status_text: "Not Found".into(),
		};
		assert_eq!(err.to_string(), "404: Not Found");
	}

	#[test]
	fn requires_client_id() {
		let mut options = ConnectorOptions::new();
		options.user = Some(crate::UserCredentials {
			name: None,
			id: Some("42".into()),
			token: Some(SecretString::new("t")),
		});
		assert_eq!(Helix::new(&options).err(), Some(ConfigError::MissingClientId));
	}
}
