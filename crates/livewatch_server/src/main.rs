#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use livewatch_engine::Engine;
use livewatch_platform::live_page::{LivePageClient, LivePageSource};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::api::{ApiState, StartRequest};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::watchlist::WatchlistStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: livewatch_server [--config path] [--bind host:port]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.livewatch/config.toml)\n\
\t--bind    Control API bind address (overrides config)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	config: Option<PathBuf>,
	bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
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
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,livewatch_server=debug,livewatch_engine=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("livewatch_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		server_cfg.server.control_bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let live_cfg = server_cfg.live_page_config();
	let source = Arc::new(LivePageSource::new(&live_cfg)?);
	let probe = Arc::new(LivePageClient::new(&live_cfg)?);
	let engine = Arc::new(Engine::new(server_cfg.engine_config(), source, probe));

	let watchlist = Arc::new(WatchlistStore::load(server_cfg.server.watchlist_path.clone())?);
	let state = Arc::new(ApiState::new(
		engine,
		watchlist,
		server_cfg.discord_config(),
		server_cfg.notify.targets(),
	));

	if server_cfg.engine.autostart && server_cfg.notify.webhook_url.is_some() {
		match state.start_monitoring(StartRequest::default()) {
			Ok(()) => info!("monitoring started at boot"),
			Err(e) => warn!(error = %e, "autostart failed"),
		}
	}

	let bind: SocketAddr = server_cfg
		.server
		.control_bind
		.parse()
		.with_context(|| format!("invalid control bind address {:?}", server_cfg.server.control_bind))?;
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind control API on {bind}"))?;
	info!(%bind, "control API listening");
	health_state.mark_ready();

	tokio::select! {
		res = crate::server::api::serve(listener, Arc::clone(&state)) => {
			if let Err(e) = res {
				error!(error = %e, "control API stopped");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
		}
	}

	if state.engine().is_running() {
		state.stop_monitoring().await;
	}

	Ok(())
}
