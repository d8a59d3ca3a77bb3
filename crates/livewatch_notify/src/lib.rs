#![forbid(unsafe_code)]

//! Notification sink contract.
//!
//! The engine only ever talks to a [`NotificationSink`]; formatting and
//! delivery to an external channel live behind it.

pub mod discord;

use livewatch_domain::BroadcasterId;
use thiserror::Error;

pub use discord::{DiscordConfig, DiscordWebhookSink, TEST_BROADCASTER, WebhookTargets};

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("no webhook url configured")]
	NotConfigured,

	#[error("webhook returned status {status}: {body}")]
	Status { status: u16, body: String },

	#[error("webhook transport error: {0}")]
	Transport(String),
}

/// A broadcaster went live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartNotice {
	pub broadcaster: BroadcasterId,
	pub is_host: bool,
	pub stream_url: String,
	pub viewer_count: Option<u64>,
	pub title: Option<String>,
}

/// A broadcaster's session genuinely ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndNotice {
	pub broadcaster: BroadcasterId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftNotice {
	pub broadcaster: BroadcasterId,
	pub gift_name: String,
	pub count: u64,
	pub gifter: Option<String>,
}

/// Delivery contract used by the engine's dispatcher.
///
/// Implementations report success or failure only; they must not retry on
/// their own. Retries happen through the engine's event and poll cadence.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync + 'static {
	async fn emit_start(&self, notice: &StartNotice) -> Result<(), NotifyError>;

	async fn emit_end(&self, notice: &EndNotice) -> Result<(), NotifyError>;

	async fn emit_gift(&self, notice: &GiftNotice) -> Result<(), NotifyError>;
}
