#![forbid(unsafe_code)]

//! Discord webhook sink.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use livewatch_domain::{BroadcasterId, SecretString};
use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{EndNotice, GiftNotice, NotificationSink, NotifyError, StartNotice};

/// Fake user shown by the webhook self-test.
pub const TEST_BROADCASTER: &str = "test_user";

const GENERIC_GIFT_NAME: &str = "Gift";
const FOOTER_TEXT: &str = "livewatch";
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
	/// Site root used for profile and live links.
	pub site_base_url: String,
	pub request_timeout: Duration,
}

impl Default for DiscordConfig {
	fn default() -> Self {
		Self {
			site_base_url: "https://www.tiktok.com".to_string(),
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Where notifications go. Gifts use `gift_webhook_url` when set.
#[derive(Debug, Clone)]
pub struct WebhookTargets {
	pub webhook_url: SecretString,
	pub gift_webhook_url: Option<SecretString>,
}

impl WebhookTargets {
	pub fn new(webhook_url: SecretString, gift_webhook_url: Option<SecretString>) -> Self {
		Self {
			webhook_url,
			gift_webhook_url: gift_webhook_url.filter(|u| !u.is_blank()),
		}
	}

	fn main(&self) -> Result<&SecretString, NotifyError> {
		if self.webhook_url.is_blank() {
			return Err(NotifyError::NotConfigured);
		}
		Ok(&self.webhook_url)
	}

	fn gift(&self) -> Result<&SecretString, NotifyError> {
		match &self.gift_webhook_url {
			Some(url) => Ok(url),
			None => self.main(),
		}
	}
}

pub struct DiscordWebhookSink {
	client: reqwest::Client,
	targets: WebhookTargets,
	site_base_url: String,
}

impl DiscordWebhookSink {
	pub fn new(targets: WebhookTargets, cfg: &DiscordConfig) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(cfg.request_timeout)
			.build()
			.context("build discord http client")?;

		Ok(Self {
			client,
			targets,
			site_base_url: cfg.site_base_url.trim_end_matches('/').to_string(),
		})
	}

	/// Send a fake start notification to the main webhook.
	pub async fn send_test(&self, broadcaster: BroadcasterId) -> Result<(), NotifyError> {
		self.emit_start(&test_notice(&self.site_base_url, broadcaster)).await
	}

	async fn post(&self, url: &SecretString, payload: &Value) -> Result<(), NotifyError> {
		let resp = self
			.client
			.post(url.expose())
			.json(payload)
			.send()
			.await
			.map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;

		let status = resp.status();
		if status.is_success() {
			debug!(status = status.as_u16(), "discord webhook delivered");
			return Ok(());
		}

		let mut body = resp.text().await.unwrap_or_default();
		if body.len() > ERROR_BODY_LIMIT {
			let mut cut = ERROR_BODY_LIMIT;
			while !body.is_char_boundary(cut) {
				cut -= 1;
			}
			body.truncate(cut);
		}
		warn!(status = status.as_u16(), %body, "discord webhook rejected message");
		Err(NotifyError::Status {
			status: status.as_u16(),
			body,
		})
	}
}

#[async_trait::async_trait]
impl NotificationSink for DiscordWebhookSink {
	async fn emit_start(&self, notice: &StartNotice) -> Result<(), NotifyError> {
		let url = self.targets.main()?;
		let embed = start_embed(&self.site_base_url, notice, random_color(), Utc::now());
		self.post(url, &payload(embed, true)).await
	}

	async fn emit_end(&self, notice: &EndNotice) -> Result<(), NotifyError> {
		let url = self.targets.main()?;
		let embed = end_embed(&self.site_base_url, notice, random_color(), Utc::now());
		self.post(url, &payload(embed, true)).await
	}

	async fn emit_gift(&self, notice: &GiftNotice) -> Result<(), NotifyError> {
		let url = self.targets.gift()?;
		let embed = gift_embed(&self.site_base_url, notice, random_color(), Utc::now());
		self.post(url, &payload(embed, false)).await
	}
}

/// Notice used by the webhook self-test.
pub fn test_notice(site_base_url: &str, broadcaster: BroadcasterId) -> StartNotice {
	StartNotice {
		stream_url: format!("{}/@{}/live", site_base_url.trim_end_matches('/'), broadcaster),
		broadcaster,
		is_host: false,
		viewer_count: Some(999),
		title: Some("Test Stream - Webhook Test".to_string()),
	}
}

fn payload(embed: Value, mention_everyone: bool) -> Value {
	let mut payload = json!({ "embeds": [embed] });
	if mention_everyone {
		payload["content"] = json!("@everyone");
	}
	payload
}

/// Random embed color with every channel in `50..=255`.
pub fn random_color() -> u32 {
	let mut rng = rand::rng();
	let r: u32 = rng.random_range(50..=255);
	let g: u32 = rng.random_range(50..=255);
	let b: u32 = rng.random_range(50..=255);
	(r << 16) | (g << 8) | b
}

fn profile_url(site: &str, id: &str) -> String {
	format!("{site}/@{id}")
}

fn footer(now: DateTime<Utc>) -> Value {
	json!({ "text": format!("{FOOTER_TEXT} • {}", now.format("%Y-%m-%d %H:%M:%S UTC")) })
}

fn author(site: &str, id: &str) -> Value {
	json!({ "name": format!("@{id}"), "url": profile_url(site, id) })
}

fn field(name: &str, value: String) -> Value {
	json!({ "name": name, "value": value, "inline": true })
}

pub fn start_embed(site: &str, notice: &StartNotice, color: u32, now: DateTime<Utc>) -> Value {
	let id = notice.broadcaster.as_str();

	let mut description = format!("**{id}** is now streaming live!");
	if let Some(title) = notice.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
		description = format!("**{title}**\n\n{description}");
	}
	if notice.is_host {
		description = format!("🏠 **HOST** - {description}");
	}

	let mut fields = Vec::new();
	if let Some(viewers) = notice.viewer_count.filter(|v| *v > 0) {
		fields.push(field("👁️ Viewers", group_thousands(viewers)));
	}
	fields.push(field("🔗 Stream Link", format!("[Watch Live]({})", notice.stream_url)));
	fields.push(field("👤 Profile", format!("[@{id}]({})", profile_url(site, id))));

	json!({
		"title": format!("🔴 {id} is now LIVE!"),
		"description": description,
		"url": notice.stream_url,
		"color": color,
		"author": author(site, id),
		"fields": fields,
		"footer": footer(now),
		"timestamp": now.to_rfc3339(),
	})
}

pub fn end_embed(site: &str, notice: &EndNotice, color: u32, now: DateTime<Utc>) -> Value {
	let id = notice.broadcaster.as_str();
	json!({
		"title": format!("⚫ {id} ended their live stream"),
		"description": format!("**{id}** has ended their live stream."),
		"url": profile_url(site, id),
		"color": color,
		"author": author(site, id),
		"fields": [
			field("📊 Status", "Stream Ended".to_string()),
			field("👤 Profile", format!("[@{id}]({})", profile_url(site, id))),
			field("⏰ Ended At", now.format("%H:%M:%S UTC").to_string()),
		],
		"footer": footer(now),
		"timestamp": now.to_rfc3339(),
	})
}

pub fn gift_embed(site: &str, notice: &GiftNotice, color: u32, now: DateTime<Utc>) -> Value {
	let id = notice.broadcaster.as_str();
	let live_url = format!("{}/live", profile_url(site, id));

	let description = if notice.gift_name.is_empty() || notice.gift_name == GENERIC_GIFT_NAME {
		format!("**{id}** received a gift during their live stream!")
	} else {
		format!("**{id}** received **{}** during their live stream!", notice.gift_name)
	};

	let mut fields = vec![
		field("🎁 Gift Type", notice.gift_name.clone()),
		field("📦 Quantity", group_thousands(notice.count)),
	];
	if let Some(gifter) = notice.gifter.as_deref().filter(|g| !g.is_empty()) {
		fields.push(field("👤 From", format!("[@{gifter}]({})", profile_url(site, gifter))));
	}
	fields.push(field("📺 Streamer", format!("[@{id}]({})", profile_url(site, id))));
	fields.push(field("🔴 Watch Live", format!("[Join Stream]({live_url})")));

	json!({
		"title": "🎁 Gift Received!",
		"description": description,
		"url": live_url,
		"color": color,
		"author": author(site, id),
		"fields": fields,
		"footer": footer(now),
		"timestamp": now.to_rfc3339(),
	})
}

/// `1234567` → `"1,234,567"`.
pub fn group_thousands(n: u64) -> String {
	let digits = n.to_string();
	let mut out = String::with_capacity(digits.len() + digits.len() / 3);
	for (i, c) in digits.chars().enumerate() {
		if i > 0 && (digits.len() - i) % 3 == 0 {
			out.push(',');
		}
		out.push(c);
	}
	out
}
