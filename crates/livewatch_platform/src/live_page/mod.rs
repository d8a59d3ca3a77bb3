#![forbid(unsafe_code)]

//! Live-page client.
//!
//! Checks a broadcaster's public live page over HTTP. Used as the
//! independent [`crate::LiveProbe`] and as a degraded [`crate::SignalSource`]
//! when no push connector is available.

mod client;
mod source;

use std::time::Duration;

pub use client::{LivePageClient, live_page_url};
pub use source::LivePageSource;

#[derive(Debug, Clone)]
pub struct LivePageConfig {
	/// Site root, e.g. `https://www.tiktok.com`.
	pub base_url: String,
	pub user_agent: String,
	pub request_timeout: Duration,
	/// How often an open session re-checks the page.
	pub watch_interval: Duration,
}

impl Default for LivePageConfig {
	fn default() -> Self {
		Self {
			base_url: "https://www.tiktok.com".to_string(),
			user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
			request_timeout: Duration::from_secs(10),
			watch_interval: Duration::from_secs(30),
		}
	}
}
