#![forbid(unsafe_code)]

use std::fmt;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
	Patch,
}

impl HttpMethod {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Get => "GET",
			Self::Post => "POST",
			Self::Patch => "PATCH",
		}
	}
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
	pub method: HttpMethod,
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: Option<String>,
}

impl HttpRequest {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
	pub status: u16,
	pub status_text: String,
	pub body: String,
}

impl HttpResponse {
	pub fn ok(&self) -> bool {
		(200..300).contains(&self.status)
	}

	pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
		serde_json::from_str(&self.body).with_context(|| format!("decode json (status={})", self.status))
	}
}

/// Out-of-band HTTP used for subscription management and REST calls.
#[async_trait]
pub trait HttpClient: Send + Sync {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// Default client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
	http: reqwest::Client,
}

impl ReqwestHttpClient {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streamline/0.x")
			.build()
			.context("build reqwest client")?;
		Ok(Self { http })
	}
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
		let method = match request.method {
			HttpMethod::Get => reqwest::Method::GET,
			HttpMethod::Post => reqwest::Method::POST,
			HttpMethod::Patch => reqwest::Method::PATCH,
		};

		let mut req = self.http.request(method, request.url.as_str());
		for (name, value) in &request.headers {
			req = req.header(name.as_str(), value.as_str());
		}
		if let Some(body) = request.body {
			req = req.body(body);
		}

		let resp = req
			.send()
			.await
			.with_context(|| format!("{} {} send", request.method, request.url))?;
		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("{} {} read body", request.method, request.url))?;

		Ok(HttpResponse {
			status: status.as_u16(),
			status_text: status.canonical_reason().unwrap_or_default().to_string(),
			body,
		})
	}
}
