#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use livewatch_domain::SecretString;
use livewatch_engine::EngineConfig;
use livewatch_notify::{DiscordConfig, WebhookTargets};
use livewatch_platform::live_page::LivePageConfig;
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONTROL_BIND: &str = "127.0.0.1:5000";
const WATCHLIST_FILE: &str = "monitored_users.json";

/// Default config directory: `~/.livewatch`.
pub fn default_config_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".livewatch"))
}

/// Default config path: `~/.livewatch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_config_dir()?.join("config.toml"))
}

/// Load the server config from TOML and `LIVEWATCH_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let default_dir = path
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	let mut cfg = ServerConfig::from_file(file_cfg, &default_dir);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub notify: NotifySettings,
	pub engine: EngineSettings,
	pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Control API bind address (host:port).
	pub control_bind: String,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// JSON file holding the watch-list.
	pub watchlist_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
	/// Used when `/api/monitoring/start` does not supply one.
	pub webhook_url: Option<SecretString>,
	pub gift_webhook_url: Option<SecretString>,
	pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
	pub poll_interval: Duration,
	pub connect_backoff: Duration,
	pub min_session: Duration,
	pub settle_delay: Duration,
	pub end_cooldown: Duration,
	pub probe_timeout: Duration,
	/// Start monitoring at boot when a webhook URL is configured.
	pub autostart: bool,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
	pub base_url: String,
	pub user_agent: String,
	pub watch_interval: Duration,
}

impl NotifySettings {
	/// Configured webhook targets, if a main webhook URL is set.
	pub fn targets(&self) -> Option<WebhookTargets> {
		self.webhook_url
			.clone()
			.map(|url| WebhookTargets::new(url, self.gift_webhook_url.clone()))
	}
}

impl ServerConfig {
	pub fn engine_config(&self) -> EngineConfig {
		EngineConfig {
			poll_interval: self.engine.poll_interval,
			connect_backoff: self.engine.connect_backoff,
			min_session: self.engine.min_session,
			settle_delay: self.engine.settle_delay,
			end_cooldown: self.engine.end_cooldown,
			probe_timeout: self.engine.probe_timeout,
			stream_url_base: self.source.base_url.clone(),
			..EngineConfig::default()
		}
	}

	pub fn live_page_config(&self) -> LivePageConfig {
		LivePageConfig {
			base_url: self.source.base_url.clone(),
			user_agent: self.source.user_agent.clone(),
			request_timeout: self.engine.probe_timeout,
			watch_interval: self.source.watch_interval,
		}
	}

	pub fn discord_config(&self) -> DiscordConfig {
		DiscordConfig {
			site_base_url: self.source.base_url.clone(),
			request_timeout: self.notify.request_timeout,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	notify: FileNotifySettings,

	#[serde(default)]
	engine: FileEngineSettings,

	#[serde(default)]
	source: FileSourceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	control_bind: Option<String>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	watchlist_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	webhook_url: Option<String>,
	gift_webhook_url: Option<String>,
	request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEngineSettings {
	poll_interval_secs: Option<u64>,
	connect_backoff_secs: Option<u64>,
	min_session_secs: Option<u64>,
	settle_delay_secs: Option<u64>,
	end_cooldown_secs: Option<u64>,
	probe_timeout_secs: Option<u64>,
	autostart: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSourceSettings {
	base_url: Option<String>,
	user_agent: Option<String>,
	watch_interval_secs: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Seconds to a duration; zero falls back to `default` because the poll
/// timer and the probe timeout cannot be zero.
fn secs_or(v: Option<u64>, default: Duration) -> Duration {
	v.filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(default)
}

impl ServerConfig {
	fn from_file(file: FileConfig, default_dir: &Path) -> Self {
		let engine_defaults = EngineConfig::default();
		let discord_defaults = DiscordConfig::default();
		let source_defaults = LivePageConfig::default();

		Self {
			server: ServerSettings {
				control_bind: non_blank(file.server.control_bind).unwrap_or_else(|| DEFAULT_CONTROL_BIND.to_string()),
				health_bind: non_blank(file.server.health_bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				watchlist_path: non_blank(file.server.watchlist_path)
					.map(PathBuf::from)
					.unwrap_or_else(|| default_dir.join(WATCHLIST_FILE)),
			},
			notify: NotifySettings {
				webhook_url: non_blank(file.notify.webhook_url).map(SecretString::new),
				gift_webhook_url: non_blank(file.notify.gift_webhook_url).map(SecretString::new),
				request_timeout: secs_or(file.notify.request_timeout_secs, discord_defaults.request_timeout),
			},
			engine: EngineSettings {
				poll_interval: secs_or(file.engine.poll_interval_secs, engine_defaults.poll_interval),
				connect_backoff: secs_or(file.engine.connect_backoff_secs, engine_defaults.connect_backoff),
				min_session: file
					.engine
					.min_session_secs
					.map(Duration::from_secs)
					.unwrap_or(engine_defaults.min_session),
				settle_delay: file
					.engine
					.settle_delay_secs
					.map(Duration::from_secs)
					.unwrap_or(engine_defaults.settle_delay),
				end_cooldown: file
					.engine
					.end_cooldown_secs
					.map(Duration::from_secs)
					.unwrap_or(engine_defaults.end_cooldown),
				probe_timeout: secs_or(file.engine.probe_timeout_secs, engine_defaults.probe_timeout),
				autostart: file.engine.autostart.unwrap_or(false),
			},
			source: SourceSettings {
				base_url: non_blank(file.source.base_url)
					.map(|u| u.trim_end_matches('/').to_string())
					.unwrap_or(source_defaults.base_url),
				user_agent: non_blank(file.source.user_agent).unwrap_or(source_defaults.user_agent),
				watch_interval: secs_or(file.source.watch_interval_secs, source_defaults.watch_interval),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
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

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| non_blank(env(key));
	let secs = |key: &str| {
		env(key)
			.and_then(|v| v.trim().parse::<u64>().ok())
			.filter(|s| *s > 0)
			.map(Duration::from_secs)
	};

	if let Some(v) = string("LIVEWATCH_CONTROL_BIND") {
		cfg.server.control_bind = v;
		info!("server config: control_bind overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_WATCHLIST_PATH") {
		cfg.server.watchlist_path = PathBuf::from(v);
		info!("server config: watchlist_path overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_WEBHOOK_URL") {
		cfg.notify.webhook_url = Some(SecretString::new(v));
		info!("notify config: webhook_url overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_GIFT_WEBHOOK_URL") {
		cfg.notify.gift_webhook_url = Some(SecretString::new(v));
		info!("notify config: gift_webhook_url overridden by env");
	}

	if let Some(d) = secs("LIVEWATCH_POLL_INTERVAL_SECS") {
		cfg.engine.poll_interval = d;
		info!(secs = d.as_secs(), "engine config: poll_interval overridden by env");
	}

	if let Some(d) = secs("LIVEWATCH_CONNECT_BACKOFF_SECS") {
		cfg.engine.connect_backoff = d;
		info!(secs = d.as_secs(), "engine config: connect_backoff overridden by env");
	}

	if let Some(d) = secs("LIVEWATCH_PROBE_TIMEOUT_SECS") {
		cfg.engine.probe_timeout = d;
		info!(secs = d.as_secs(), "engine config: probe_timeout overridden by env");
	}

	if let Some(v) = env("LIVEWATCH_AUTOSTART")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.engine.autostart = enabled;
		info!(enabled, "engine config: autostart overridden by env");
	}

	if let Some(v) = string("LIVEWATCH_SOURCE_BASE_URL") {
		cfg.source.base_url = v.trim_end_matches('/').to_string();
		info!("source config: base_url overridden by env");
	}

	if cfg.engine.autostart && cfg.notify.webhook_url.is_none() {
		warn!("engine config: autostart requested but no webhook_url configured; monitoring stays stopped");
	}
}
