#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use livewatch_domain::BroadcasterId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LivePageClient, LivePageConfig};
use crate::{
	SessionMetadata, SignalSource, SourceControl, SourceControlRx, SourceEvent, SourceEventTx, new_session_id, status,
	status_error,
};

const SOURCE_NAME: &str = "live_page";

/// Degraded signal source built on live-page polling.
///
/// A `Connect` opens a "session" when the page reports live and keeps
/// re-checking it; the session closes (emitting `Disconnected`) once the
/// page stops reporting live or the engine asks to disconnect.
pub struct LivePageSource {
	client: LivePageClient,
	watch_interval: Duration,
}

impl LivePageSource {
	pub fn new(cfg: &LivePageConfig) -> anyhow::Result<Self> {
		Ok(Self {
			client: LivePageClient::new(cfg)?,
			watch_interval: cfg.watch_interval,
		})
	}
}

struct Watcher {
	generation: u64,
	task: JoinHandle<()>,
	/// Set once the page confirmed live for this watcher.
	opened: Arc<AtomicBool>,
}

#[async_trait]
impl SignalSource for LivePageSource {
	fn name(&self) -> &'static str {
		SOURCE_NAME
	}

	async fn run(self: Arc<Self>, mut control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		let (done_tx, mut done_rx) = mpsc::channel::<(BroadcasterId, u64)>(64);
		let mut watchers: HashMap<BroadcasterId, Watcher> = HashMap::new();
		let mut next_generation: u64 = 0;

		let _ = events_tx.try_send(status(
			SOURCE_NAME,
			true,
			format!("live page source online (session_id={session_id})"),
		));
		info!(%session_id, "live page source started");

		loop {
			tokio::select! {
				done = done_rx.recv() => {
					let Some((broadcaster, generation)) = done else {
						continue;
					};
					if watchers.get(&broadcaster).is_some_and(|w| w.generation == generation) {
						watchers.remove(&broadcaster);
					}
				}

				cmd = control_rx.recv() => {
					let Some(cmd) = cmd else {
						info!("live page source control channel closed; shutting down");
						break;
					};

					match cmd {
						SourceControl::Connect { broadcaster } => {
							if watchers.get(&broadcaster).is_some_and(|w| !w.task.is_finished()) {
								debug!(%broadcaster, "connect ignored; session already open");
								continue;
							}

							next_generation += 1;
							let generation = next_generation;
							let opened = Arc::new(AtomicBool::new(false));
							let task = tokio::spawn(watch_broadcaster(
								self.client.clone(),
								broadcaster.clone(),
								self.watch_interval,
								events_tx.clone(),
								done_tx.clone(),
								generation,
								Arc::clone(&opened),
							));
							watchers.insert(broadcaster, Watcher { generation, task, opened });
						}

						SourceControl::Disconnect { broadcaster } => {
							let Some(watcher) = watchers.remove(&broadcaster) else {
								debug!(%broadcaster, "disconnect ignored; no open session");
								continue;
							};
							watcher.task.abort();
							if watcher.opened.load(Ordering::Acquire) {
								let _ = events_tx.send(SourceEvent::Disconnected { broadcaster }).await;
							}
						}

						SourceControl::Shutdown => {
							info!("live page source received Shutdown");
							break;
						}
					}
				}
			}
		}

		for (_, watcher) in watchers.drain() {
			watcher.task.abort();
		}

		let _ = events_tx.try_send(status(SOURCE_NAME, false, "live page source offline"));
		Ok(())
	}
}

async fn watch_broadcaster(
	client: LivePageClient,
	broadcaster: BroadcasterId,
	interval: Duration,
	events_tx: SourceEventTx,
	done_tx: mpsc::Sender<(BroadcasterId, u64)>,
	generation: u64,
	opened: Arc<AtomicBool>,
) {
	match client.check_live(&broadcaster).await {
		Ok(true) => {
			opened.store(true, Ordering::Release);
			let metadata = SessionMetadata {
				stream_url: Some(client.live_url(&broadcaster)),
				..SessionMetadata::default()
			};
			let _ = events_tx
				.send(SourceEvent::Connected {
					broadcaster: broadcaster.clone(),
					metadata,
				})
				.await;
		}
		Ok(false) => {
			let _ = events_tx
				.send(SourceEvent::ConnectFailed {
					broadcaster: broadcaster.clone(),
					error: "broadcaster is not live".to_string(),
				})
				.await;
			let _ = done_tx.send((broadcaster, generation)).await;
			return;
		}
		Err(e) => {
			warn!(%broadcaster, error = %e, "live page connect check failed");
			let _ = events_tx.try_send(status_error(SOURCE_NAME, format!("connect check failed for {broadcaster}"), &e));
			let _ = events_tx
				.send(SourceEvent::ConnectFailed {
					broadcaster: broadcaster.clone(),
					error: e.to_string(),
				})
				.await;
			let _ = done_tx.send((broadcaster, generation)).await;
			return;
		}
	}

	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;
		match client.check_live(&broadcaster).await {
			Ok(true) => {}
			Ok(false) => break,
			Err(e) => {
				debug!(%broadcaster, error = %e, "live page re-check failed; keeping session open");
			}
		}
	}

	info!(%broadcaster, "live page no longer reports live; closing session");
	let _ = events_tx
		.send(SourceEvent::Disconnected {
			broadcaster: broadcaster.clone(),
		})
		.await;
	let _ = done_tx.send((broadcaster, generation)).await;
}
