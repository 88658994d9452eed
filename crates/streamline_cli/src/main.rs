#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;

use streamline_platform::{ChatConnector, ConnectorFactory, EventPayload, EventSubConnector, Multi, PubsubConnector};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamline [--config path] [--connectors chat,pubsub,eventsub]\n\
\n\
Options:\n\
\t--config      Config file (default: ~/.streamline/config.toml)\n\
\t--connectors  Comma-separated connectors to start (default: chat)\n\
\t--help        Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	connectors: Option<Vec<String>>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		connectors: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--connectors" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let names: Vec<String> = v
					.split(',')
					.map(str::trim)
					.filter(|s| !s.is_empty())
					.map(str::to_string)
					.collect();
				if names.is_empty() {
					eprintln!("--connectors must name at least one connector");
					usage_and_exit();
				}
				args.connectors = Some(names);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,streamline_platform=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn factory_for(name: &str) -> anyhow::Result<ConnectorFactory> {
	match name {
		"chat" => Ok(ChatConnector::factory),
		"pubsub" => Ok(PubsubConnector::factory),
		"eventsub" => Ok(EventSubConnector::factory),
		other => anyhow::bail!("unknown connector `{other}` (expected chat, pubsub or eventsub)"),
	}
}

fn describe(payload: &EventPayload) -> String {
	match payload {
		EventPayload::Chat(msg) => {
			let who = msg.nick().unwrap_or("-");
			let text = msg.message.as_deref().unwrap_or_default();
			match &msg.channel {
				Some(channel) => format!("#{channel} <{who}> {text}"),
				None => format!("<{who}> {text}"),
			}
		}
		EventPayload::Lifecycle(name) => name.clone(),
		EventPayload::Push(v) | EventPayload::Notification(v) => v.to_string(),
		EventPayload::Empty => String::new(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let names = args
		.connectors
		.or_else(|| (!cfg.connectors.is_empty()).then(|| cfg.connectors.clone()))
		.unwrap_or_else(|| vec!["chat".to_string()]);
	let factories = names
		.iter()
		.map(|n| factory_for(n))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let multi = Multi::new(&factories, &cfg.connector_options())?;
	let _log = multi.on("*", |event| {
		if event.kind == "ping" {
			debug!(kind = %event.kind, "event");
			return;
		}
		info!(kind = %event.kind, "{}", describe(&event.data));
	});

	for (name, result) in multi.names().into_iter().zip(multi.connect().await) {
		match result {
			Ok(_) => info!(connector = name, "connected"),
			Err(e) => warn!(connector = name, error = %e, "connect failed"),
		}
	}

	tokio::signal::ctrl_c().await?;
	info!("shutting down");
	multi.disconnect().await;
	multi.stop();

	Ok(())
}
