#![forbid(unsafe_code)]

use anyhow::Context;
use livewatch_domain::BroadcasterId;
use reqwest::StatusCode;

use super::LivePageConfig;
use crate::LiveProbe;

#[derive(Debug, Clone)]
pub struct LivePageClient {
	base_url: String,
	client: reqwest::Client,
}

impl LivePageClient {
	pub fn new(cfg: &LivePageConfig) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.timeout(cfg.request_timeout)
			.user_agent(cfg.user_agent.clone())
			.build()
			.context("build live page http client")?;

		Ok(Self {
			base_url: cfg.base_url.trim_end_matches('/').to_string(),
			client,
		})
	}

	/// Public live page of a broadcaster.
	pub fn live_url(&self, broadcaster: &BroadcasterId) -> String {
		live_page_url(&self.base_url, broadcaster)
	}

	/// Check whether the live page answers with 200 (redirects mean offline).
	pub async fn check_live(&self, broadcaster: &BroadcasterId) -> anyhow::Result<bool> {
		let url = self.live_url(broadcaster);
		let resp = self
			.client
			.get(url)
			.send()
			.await
			.with_context(|| format!("live page check for {broadcaster}"))?;

		metrics::counter!("livewatch_live_page_requests_total").increment(1);

		Ok(resp.status() == StatusCode::OK)
	}
}

/// `{base}/@{id}/live`.
pub fn live_page_url(base_url: &str, broadcaster: &BroadcasterId) -> String {
	format!(
		"{}/@{}/live",
		base_url.trim_end_matches('/'),
		urlencoding::encode(broadcaster.as_str())
	)
}

#[async_trait::async_trait]
impl LiveProbe for LivePageClient {
	async fn is_live(&self, broadcaster: &BroadcasterId) -> anyhow::Result<bool> {
		self.check_live(broadcaster).await
	}
}
