#![forbid(unsafe_code)]

pub mod gift;
pub mod live_page;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use livewatch_domain::BroadcasterId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use gift::{GENERIC_GIFT_NAME, GiftEvent, normalize_gift_payload};

/// Engine → source control message.
///
/// Both verbs are fire-and-forget and idempotent: connecting an already
/// connected broadcaster or disconnecting an idle one is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceControl {
	/// Open a session to the broadcaster's live channel.
	Connect {
		broadcaster: BroadcasterId,
	},

	/// Close the broadcaster's session, if any.
	Disconnect {
		broadcaster: BroadcasterId,
	},

	/// Request a graceful shutdown.
	Shutdown,
}

/// Metadata attached to a connect confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
	#[serde(default)]
	pub room_id: Option<String>,

	#[serde(default)]
	pub stream_url: Option<String>,

	#[serde(default)]
	pub viewer_count: Option<u64>,

	#[serde(default)]
	pub title: Option<String>,
}

/// Source → engine event message.
#[derive(Debug, Clone)]
pub enum SourceEvent {
	/// The source confirmed an active connection to the broadcaster's session.
	Connected {
		broadcaster: BroadcasterId,
		metadata: SessionMetadata,
	},

	/// A previously opened connection went away.
	Disconnected {
		broadcaster: BroadcasterId,
	},

	/// A connect attempt never confirmed.
	ConnectFailed {
		broadcaster: BroadcasterId,
		error: String,
	},

	/// Normalized gift event.
	Gift {
		broadcaster: BroadcasterId,
		gift: GiftEvent,
	},

	/// Source status update.
	Status(SourceStatus),
}

impl SourceEvent {
	/// Broadcaster the event refers to, if any.
	pub fn broadcaster(&self) -> Option<&BroadcasterId> {
		match self {
			Self::Connected { broadcaster, .. }
			| Self::Disconnected { broadcaster }
			| Self::ConnectFailed { broadcaster, .. }
			| Self::Gift { broadcaster, .. } => Some(broadcaster),
			Self::Status(_) => None,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::Connected { .. } => "connected",
			Self::Disconnected { .. } => "disconnected",
			Self::ConnectFailed { .. } => "connect_failed",
			Self::Gift { .. } => "gift",
			Self::Status(_) => "status",
		}
	}
}

/// Source status event.
#[derive(Debug, Clone)]
pub struct SourceStatus {
	pub source: &'static str,
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Helper types for wiring sources.
pub type SourceControlTx = mpsc::Sender<SourceControl>;
pub type SourceControlRx = mpsc::Receiver<SourceControl>;
pub type SourceEventTx = mpsc::Sender<SourceEvent>;
pub type SourceEventRx = mpsc::Receiver<SourceEvent>;

/// Trait representing a runnable signal source.
///
/// `run` is invoked once per engine start with fresh channels, so a source
/// must be restartable.
#[async_trait::async_trait]
pub trait SignalSource: Send + Sync + 'static {
	/// Short name used in logs and status events.
	fn name(&self) -> &'static str;

	/// Run the source until shutdown or fatal error.
	async fn run(self: Arc<Self>, control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()>;
}

/// Independent, out-of-band liveness check.
#[async_trait::async_trait]
pub trait LiveProbe: Send + Sync + 'static {
	/// `Ok(true)` when the broadcaster currently appears live.
	async fn is_live(&self, broadcaster: &BroadcasterId) -> anyhow::Result<bool>;
}

/// Build a standard bounded channel pair.
pub fn bounded_source_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (SourceControlTx, SourceControlRx, SourceEventTx, SourceEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Build a status event.
pub fn status(source: &'static str, connected: bool, detail: impl Into<String>) -> SourceEvent {
	SourceEvent::Status(SourceStatus {
		source,
		connected,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	})
}

/// Build an error status event.
pub fn status_error(source: &'static str, detail: impl Into<String>, err: impl fmt::Display) -> SourceEvent {
	SourceEvent::Status(SourceStatus {
		source,
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
