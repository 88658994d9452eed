#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use streamline_platform::{ConnectorOptions, RetryPolicy, SecretString, UserCredentials};
use tracing::{info, warn};

/// Default config path: `~/.streamline/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streamline").join("config.toml"))
}

/// Load TOML from `path` (missing file = defaults), then apply env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<CliConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CliConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct CliConfig {
	pub user: UserSettings,
	pub client_id: Option<String>,
	pub channel: Option<String>,
	pub topics: Vec<String>,
	pub eventsub_topics: Vec<String>,

	/// Connectors started when `--connectors` is not given.
	pub connectors: Vec<String>,

	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,

	pub timing: TimingSettings,
	pub endpoints: EndpointSettings,
}

#[derive(Debug, Clone, Default)]
pub struct UserSettings {
	pub name: Option<String>,
	pub id: Option<String>,
	pub token: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct TimingSettings {
	pub chat_timeout: Option<Duration>,
	pub retry_max_attempts: Option<u32>,
	pub retry_base_delay: Option<Duration>,
	pub retry_max_delay: Option<Duration>,
	pub handshake_timeout: Option<Duration>,
	pub say_timeout: Option<Duration>,
	pub ping_interval: Option<Duration>,
}

/// Endpoint overrides, mostly for local test servers.
#[derive(Debug, Clone, Default)]
pub struct EndpointSettings {
	pub chat_url: Option<String>,
	pub pubsub_url: Option<String>,
	pub eventsub_url: Option<String>,
	pub subscriptions_url: Option<String>,
	pub helix_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	user: FileUserSettings,

	client_id: Option<String>,
	channel: Option<String>,

	#[serde(default)]
	topics: Vec<String>,

	#[serde(default)]
	eventsub_topics: Vec<String>,

	#[serde(default)]
	connectors: Vec<String>,

	metrics_bind: Option<String>,

	#[serde(default)]
	timing: FileTimingSettings,

	#[serde(default)]
	endpoints: FileEndpointSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUserSettings {
	name: Option<String>,
	id: Option<String>,
	token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTimingSettings {
	chat_timeout_ms: Option<u64>,
	retry_max_attempts: Option<u32>,
	retry_base_delay_ms: Option<u64>,
	retry_max_delay_ms: Option<u64>,
	handshake_timeout_ms: Option<u64>,
	say_timeout_ms: Option<u64>,
	ping_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEndpointSettings {
	chat_url: Option<String>,
	pubsub_url: Option<String>,
	eventsub_url: Option<String>,
	subscriptions_url: Option<String>,
	helix_base_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

fn clean_list(items: Vec<String>) -> Vec<String> {
	items
		.into_iter()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.collect()
}

impl CliConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			user: UserSettings {
				name: non_empty(file.user.name),
				id: non_empty(file.user.id),
				token: non_empty(file.user.token).map(|t| SecretString::new(strip_oauth_prefix(&t))),
			},
			client_id: non_empty(file.client_id),
			channel: non_empty(file.channel),
			topics: clean_list(file.topics),
			eventsub_topics: clean_list(file.eventsub_topics),
			connectors: clean_list(file.connectors),
			metrics_bind: non_empty(file.metrics_bind),
			timing: TimingSettings {
				chat_timeout: file.timing.chat_timeout_ms.map(Duration::from_millis),
				retry_max_attempts: file.timing.retry_max_attempts,
				retry_base_delay: file.timing.retry_base_delay_ms.map(Duration::from_millis),
				retry_max_delay: file.timing.retry_max_delay_ms.map(Duration::from_millis),
				handshake_timeout: file.timing.handshake_timeout_ms.map(Duration::from_millis),
				say_timeout: file.timing.say_timeout_ms.map(Duration::from_millis),
				ping_interval: file.timing.ping_interval_secs.map(Duration::from_secs),
			},
			endpoints: EndpointSettings {
				chat_url: non_empty(file.endpoints.chat_url),
				pubsub_url: non_empty(file.endpoints.pubsub_url),
				eventsub_url: non_empty(file.endpoints.eventsub_url),
				subscriptions_url: non_empty(file.endpoints.subscriptions_url),
				helix_base_url: non_empty(file.endpoints.helix_base_url),
			},
		}
	}

	/// Options shared by every connector the binary starts.
	pub fn connector_options(&self) -> ConnectorOptions {
		let mut options = ConnectorOptions::new();

		if self.user.name.is_some() || self.user.id.is_some() || self.user.token.is_some() {
			options.user = Some(UserCredentials {
				name: self.user.name.clone(),
				id: self.user.id.clone(),
				token: self.user.token.clone(),
			});
		}
		options.channel = self.channel.clone();
		options.topics = self.topics.clone();
		options.eventsub_topics = self.eventsub_topics.clone();
		options.client_id = self.client_id.clone();

		let t = &self.timing;
		if let Some(v) = t.chat_timeout {
			options.chat_timeout = v;
		}
		let defaults = RetryPolicy::default();
		options.retry = RetryPolicy {
			max_attempts: t.retry_max_attempts,
			base_delay: t.retry_base_delay.unwrap_or(defaults.base_delay),
			max_delay: t.retry_max_delay.unwrap_or(defaults.max_delay),
		};
		options.handshake_timeout = t.handshake_timeout;
		options.say_timeout = t.say_timeout;
		if let Some(v) = t.ping_interval {
			options.ping_interval = v;
		}

		let e = &self.endpoints;
		if let Some(v) = &e.chat_url {
			options.chat_url = v.clone();
		}
		if let Some(v) = &e.pubsub_url {
			options.pubsub_url = v.clone();
		}
		if let Some(v) = &e.eventsub_url {
			options.eventsub_url = v.clone();
		}
		if let Some(v) = &e.subscriptions_url {
			options.subscriptions_url = v.clone();
		}
		if let Some(v) = &e.helix_base_url {
			options.helix_base_url = v.clone();
		}

		options
	}
}

fn strip_oauth_prefix(token: &str) -> String {
	let token = token.trim();
	token.strip_prefix("oauth:").unwrap_or(token).to_string()
}

fn split_list(v: &str) -> Vec<String> {
	v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CliConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut CliConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("STREAMLINE_USER_NAME") {
		cfg.user.name = Some(v);
		info!("user config: name overridden by env");
	}

	if let Some(v) = var("STREAMLINE_USER_ID") {
		cfg.user.id = Some(v);
		info!("user config: id overridden by env");
	}

	if let Some(v) = var("STREAMLINE_USER_TOKEN") {
		cfg.user.token = Some(SecretString::new(strip_oauth_prefix(&v)));
		info!("user config: token overridden by env");
	}

	if let Some(v) = var("STREAMLINE_CLIENT_ID") {
		cfg.client_id = Some(v);
		info!("config: client_id overridden by env");
	}

	if let Some(v) = var("STREAMLINE_CHANNEL") {
		cfg.channel = Some(v);
		info!("config: channel overridden by env");
	}

	if let Some(v) = var("STREAMLINE_TOPICS") {
		cfg.topics = split_list(&v);
		info!(count = cfg.topics.len(), "config: topics overridden by env");
	}

	if let Some(v) = var("STREAMLINE_EVENTSUB_TOPICS") {
		cfg.eventsub_topics = split_list(&v);
		info!(count = cfg.eventsub_topics.len(), "config: eventsub_topics overridden by env");
	}

	if let Some(v) = var("STREAMLINE_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("config: metrics_bind overridden by env");
	}

	if let (Some(min), Some(max)) = (cfg.timing.retry_base_delay, cfg.timing.retry_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"timing config: retry_base_delay > retry_max_delay; swapping"
		);
		cfg.timing.retry_base_delay = Some(max);
		cfg.timing.retry_max_delay = Some(min);
	}
}
