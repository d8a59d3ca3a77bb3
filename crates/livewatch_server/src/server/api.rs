#![forbid(unsafe_code)]

//! JSON control API: watch-list management and monitoring start/stop.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use livewatch_domain::{BroadcasterId, ParseIdError, SecretString};
use livewatch_engine::{BroadcasterStatus, Engine, EngineError};
use livewatch_notify::{DiscordConfig, DiscordWebhookSink, TEST_BROADCASTER, WebhookTargets};
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::server::watchlist::{WatchEntry, WatchlistError, WatchlistStore};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("{0}")]
	BadRequest(String),

	#[error("{0}")]
	Conflict(String),

	#[error("not found")]
	NotFound,

	#[error("method not allowed")]
	MethodNotAllowed,

	#[error("{0}")]
	Upstream(String),

	#[error("{0:#}")]
	Internal(#[from] anyhow::Error),
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ApiError::Conflict(_) => StatusCode::CONFLICT,
			ApiError::NotFound => StatusCode::NOT_FOUND,
			ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl From<WatchlistError> for ApiError {
	fn from(e: WatchlistError) -> Self {
		match e {
			WatchlistError::Duplicate(_) => ApiError::BadRequest("User already in list".to_string()),
			WatchlistError::Persist(e) => ApiError::Internal(e),
		}
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct AddUserRequest {
	#[serde(default)]
	pub username: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
	#[serde(default)]
	pub webhook_url: Option<String>,
	#[serde(default)]
	pub gift_webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestWebhookRequest {
	#[serde(default)]
	pub webhook_url: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusView {
	pub is_running: bool,
	pub users_count: usize,
	pub broadcasters: BTreeMap<BroadcasterId, BroadcasterStatus>,
}

/// Shared state behind the control API.
pub struct ApiState {
	engine: Arc<Engine>,
	watchlist: Arc<WatchlistStore>,
	discord: DiscordConfig,
	/// Targets from the config file / environment.
	configured: Option<WebhookTargets>,
	/// Targets of the most recent successful start.
	active: Mutex<Option<WebhookTargets>>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_username(raw: &str) -> Result<BroadcasterId, ApiError> {
	BroadcasterId::new(raw).map_err(|e| match e {
		ParseIdError::Empty => ApiError::BadRequest("Username is required".to_string()),
		other => ApiError::BadRequest(format!("Invalid username: {other}")),
	})
}

impl ApiState {
	pub fn new(
		engine: Arc<Engine>,
		watchlist: Arc<WatchlistStore>,
		discord: DiscordConfig,
		configured: Option<WebhookTargets>,
	) -> Self {
		Self {
			engine,
			watchlist,
			discord,
			configured,
			active: Mutex::new(None),
		}
	}

	pub fn engine(&self) -> &Arc<Engine> {
		&self.engine
	}

	pub fn users(&self) -> Vec<WatchEntry> {
		self.watchlist.entries().iter().map(WatchEntry::from).collect()
	}

	pub fn add_user(&self, req: AddUserRequest) -> Result<(), ApiError> {
		let id = parse_username(&req.username)?;
		self.watchlist.add(id.clone())?;
		if self.engine.is_running() {
			self.engine.watch(id.clone());
		}
		info!(broadcaster = %id, "user added");
		Ok(())
	}

	pub fn remove_user(&self, raw: &str) -> Result<(), ApiError> {
		let id = parse_username(raw)?;
		let removed = self.watchlist.remove(&id)?;
		if self.engine.is_running() {
			self.engine.unwatch(&id);
		}
		info!(broadcaster = %id, removed, "user removal requested");
		Ok(())
	}

	/// Start the engine with the persisted watch-list.
	///
	/// The request's webhook URL wins over the configured one.
	pub fn start_monitoring(&self, req: StartRequest) -> Result<(), ApiError> {
		let targets = match non_blank(req.webhook_url) {
			Some(url) => WebhookTargets::new(
				SecretString::new(url),
				non_blank(req.gift_webhook_url).map(SecretString::new),
			),
			None => self
				.configured
				.clone()
				.ok_or_else(|| ApiError::BadRequest("Discord webhook URL is required".to_string()))?,
		};

		let sink = DiscordWebhookSink::new(targets.clone(), &self.discord)?;
		self.engine
			.start(self.watchlist.entries(), Arc::new(sink))
			.map_err(|e| match e {
				EngineError::AlreadyRunning => ApiError::Conflict("Monitoring is already running".to_string()),
				other => ApiError::Internal(anyhow!(other)),
			})?;

		*self.active.lock() = Some(targets);
		Ok(())
	}

	/// Stopping an idle engine is not an error.
	pub async fn stop_monitoring(&self) {
		if let Err(e) = self.engine.stop().await {
			debug!(error = %e, "stop requested while idle");
		}
	}

	pub fn status(&self) -> StatusView {
		let is_running = self.engine.is_running();
		let broadcasters = if is_running {
			self.engine.snapshot()
		} else {
			self.watchlist
				.entries()
				.into_iter()
				.map(|w| (w.id, BroadcasterStatus::default()))
				.collect()
		};

		StatusView {
			is_running,
			users_count: self.watchlist.count(),
			broadcasters,
		}
	}

	/// Send a fake start notification to the given, active or configured webhook.
	pub async fn test_webhook(&self, req: TestWebhookRequest) -> Result<(), ApiError> {
		let url = non_blank(req.webhook_url)
			.map(SecretString::new)
			.or_else(|| self.active.lock().as_ref().map(|t| t.webhook_url.clone()))
			.or_else(|| self.configured.as_ref().map(|t| t.webhook_url.clone()))
			.ok_or_else(|| ApiError::BadRequest("Discord webhook URL is required".to_string()))?;

		let sink = DiscordWebhookSink::new(WebhookTargets::new(url, None), &self.discord)?;
		let test_user = BroadcasterId::new(TEST_BROADCASTER).map_err(anyhow::Error::from)?;
		sink.send_test(test_user)
			.await
			.map_err(|e| ApiError::Upstream(format!("Failed to send test notification: {e}")))
	}
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
	if body.iter().all(u8::is_ascii_whitespace) {
		return Ok(T::default());
	}
	serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))
}

fn users_reply(state: &ApiState, message: &str) -> Value {
	json!({ "message": message, "users": state.users() })
}

async fn dispatch(state: &ApiState, method: &Method, path: &str, body: &[u8]) -> Result<Value, ApiError> {
	let path = match path.trim_end_matches('/') {
		"" => "/",
		p => p,
	};

	match path {
		"/api/users" if method == Method::GET => Ok(json!(state.users())),
		"/api/users" if method == Method::POST => {
			state.add_user(parse_body(body)?)?;
			Ok(users_reply(state, "User added successfully"))
		}
		"/api/monitoring/start" if method == Method::POST => {
			state.start_monitoring(parse_body(body)?)?;
			Ok(json!({ "message": "Monitoring started" }))
		}
		"/api/monitoring/stop" if method == Method::POST => {
			state.stop_monitoring().await;
			Ok(json!({ "message": "Monitoring stopped" }))
		}
		"/api/monitoring/status" if method == Method::GET => {
			serde_json::to_value(state.status()).map_err(|e| ApiError::Internal(anyhow!(e)))
		}
		"/api/webhook/test" if method == Method::POST => {
			state.test_webhook(parse_body(body)?).await?;
			Ok(json!({ "message": "Test notification sent successfully! Check your Discord channel." }))
		}
		"/api/users" | "/api/monitoring/start" | "/api/monitoring/stop" | "/api/monitoring/status" | "/api/webhook/test" => {
			Err(ApiError::MethodNotAllowed)
		}
		_ => {
			let Some(raw) = path.strip_prefix("/api/users/") else {
				return Err(ApiError::NotFound);
			};
			if method != Method::DELETE {
				return Err(ApiError::MethodNotAllowed);
			}
			let name = urlencoding::decode(raw).map_err(|e| ApiError::BadRequest(format!("Invalid username: {e}")))?;
			state.remove_user(&name)?;
			Ok(users_reply(state, "User removed successfully"))
		}
	}
}

/// Route one request to its handler and render the JSON reply.
pub async fn route(state: &ApiState, method: &Method, path: &str, body: &[u8]) -> (StatusCode, Value) {
	match dispatch(state, method, path, body).await {
		Ok(v) => (StatusCode::OK, v),
		Err(e) => {
			let status = e.status();
			if status.is_server_error() {
				warn!(%method, path, error = %e, "control request failed");
			} else {
				debug!(%method, path, status = status.as_u16(), error = %e, "control request rejected");
			}
			(status, json!({ "error": e.to_string() }))
		}
	}
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

async fn handle(req: Request<Incoming>, state: Arc<ApiState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();
	let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			debug!(error = %e, "control request body rejected");
			return Ok(json_response(
				StatusCode::PAYLOAD_TOO_LARGE,
				&json!({ "error": "request body too large or unreadable" }),
			));
		}
	};

	let (status, value) = route(&state, &parts.method, parts.uri.path(), &body).await;
	metrics::counter!("livewatch_api_requests_total", "status" => status.as_u16().to_string()).increment(1);
	Ok(json_response(status, &value))
}

/// Accept control connections until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<ApiState>) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(%remote, error = %err, "control connection error");
			}
		});
	}
}
