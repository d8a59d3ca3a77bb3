#![forbid(unsafe_code)]

use std::time::Duration;

/// Engine timing and buffering knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Poll reconciler period.
	pub poll_interval: Duration,
	/// Minimum gap between two connect attempts for one broadcaster.
	pub connect_backoff: Duration,
	/// Disconnects sooner than this after confirmation are treated as blips.
	pub min_session: Duration,
	/// Delay before the out-of-band re-check of an apparent end.
	pub settle_delay: Duration,
	/// Window after an end notification during which no further end is sent.
	pub end_cooldown: Duration,
	pub probe_timeout: Duration,
	/// Site root used to build a stream link when the source supplied none.
	pub stream_url_base: String,

	pub control_channel_capacity: usize,
	pub events_channel_capacity: usize,
	/// Gifts waiting for delivery per broadcaster; further gifts are dropped.
	pub gift_queue_capacity: usize,
	/// How long `stop` waits for the source task before aborting it.
	pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(30),
			connect_backoff: Duration::from_secs(15),
			min_session: Duration::from_secs(30),
			settle_delay: Duration::from_secs(5),
			end_cooldown: Duration::from_secs(60),
			probe_timeout: Duration::from_secs(10),
			stream_url_base: "https://www.tiktok.com".to_string(),
			control_channel_capacity: 256,
			events_channel_capacity: 1_024,
			gift_queue_capacity: 64,
			shutdown_grace: Duration::from_secs(2),
		}
	}
}
