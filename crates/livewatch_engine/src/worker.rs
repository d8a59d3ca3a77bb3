#![forbid(unsafe_code)]

//! Per-broadcaster worker.
//!
//! Source events, poll-cycle work and verification results for one
//! broadcaster all go through a single queue, so the state machine sees a
//! serialized history per broadcaster while different broadcasters proceed
//! concurrently.
//!
//! The work queue is unbounded so the run loop never waits on a worker.
//! Gift delivery runs on a separate task behind a bounded queue; when that
//! queue is full the gift is dropped.

use std::sync::Arc;

use livewatch_domain::BroadcasterId;
use livewatch_notify::{EndNotice, GiftNotice, StartNotice};
use livewatch_platform::live_page::live_page_url;
use livewatch_platform::{LiveProbe, SourceControl, SourceControlTx, SourceEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::machine::{self, ConnectOutcome, CycleContext, DisconnectOutcome, ProbeOutcome, VerifyOutcome};
use crate::probe::probe_live;
use crate::store::SessionTable;

/// Work item for a broadcaster's queue.
#[derive(Debug)]
pub(crate) enum Work {
	Source(SourceEvent),
	Reconcile(CycleContext),
	Verified { epoch: u64, outcome: ProbeOutcome },
}

/// Handle to a running worker. Aborting it drops pending verifications
/// and queued gifts.
pub(crate) struct WorkerHandle {
	pub(crate) tx: mpsc::UnboundedSender<Work>,
	task: JoinHandle<()>,
	gift_task: JoinHandle<()>,
}

impl WorkerHandle {
	pub(crate) fn abort(&self) {
		self.task.abort();
		self.gift_task.abort();
	}
}

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
	pub(crate) cfg: Arc<EngineConfig>,
	pub(crate) table: Arc<SessionTable>,
	pub(crate) dispatcher: Dispatcher,
	pub(crate) probe: Arc<dyn LiveProbe>,
	pub(crate) control_tx: SourceControlTx,
}

pub(crate) fn spawn(id: BroadcasterId, deps: WorkerDeps) -> WorkerHandle {
	let (tx, rx) = mpsc::unbounded_channel();
	let (gift_tx, gift_rx) = mpsc::channel(deps.cfg.gift_queue_capacity);
	let gift_task = tokio::spawn(deliver_gifts(deps.dispatcher.clone(), gift_rx));
	let worker = Worker {
		id,
		deps,
		self_tx: tx.clone(),
		gift_tx,
		verifications: JoinSet::new(),
	};
	let task = tokio::spawn(worker.run(rx));
	WorkerHandle { tx, task, gift_task }
}

async fn deliver_gifts(dispatcher: Dispatcher, mut rx: mpsc::Receiver<GiftNotice>) {
	while let Some(notice) = rx.recv().await {
		dispatcher.gift(&notice).await;
	}
}

struct Worker {
	id: BroadcasterId,
	deps: WorkerDeps,
	self_tx: mpsc::UnboundedSender<Work>,
	gift_tx: mpsc::Sender<GiftNotice>,
	verifications: JoinSet<()>,
}

impl Worker {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Work>) {
		while let Some(work) = rx.recv().await {
			while self.verifications.try_join_next().is_some() {}

			match work {
				Work::Source(ev) => self.on_source_event(ev).await,
				Work::Reconcile(ctx) => self.on_reconcile(ctx).await,
				Work::Verified { epoch, outcome } => self.on_verified(epoch, outcome).await,
			}
		}
		debug!(broadcaster = %self.id, "worker queue closed");
	}

	async fn on_source_event(&mut self, ev: SourceEvent) {
		match ev {
			SourceEvent::Connected { metadata, .. } => {
				let now = Instant::now();
				let peers = self.deps.table.confirmed_peers(&self.id);
				let outcome = self.deps.table.with_record(&self.id, |rec| {
					rec.metadata = metadata;
					machine::on_connected(rec, &self.id, now, &peers)
				});
				self.deps.table.reelect_host();

				match outcome {
					ConnectOutcome::NotifyStart { is_host } => {
						info!(broadcaster = %self.id, is_host, "connectivity confirmed");
						self.dispatch_start(is_host).await;
					}
					ConnectOutcome::Reconnected => {
						debug!(broadcaster = %self.id, "reconnected; start already sent for this session");
					}
				}
			}

			SourceEvent::Disconnected { .. } => self.on_disconnected(),

			SourceEvent::ConnectFailed { error, .. } => {
				self.deps.table.with_record(&self.id, machine::on_connect_failed);
				debug!(broadcaster = %self.id, %error, "connect attempt failed; retry after backoff");
			}

			SourceEvent::Gift { gift, .. } => {
				let allowed = self
					.deps
					.table
					.get(&self.id)
					.is_some_and(|rec| machine::gift_allowed(&rec));
				if !allowed {
					metrics::counter!("livewatch_gifts_dropped_total", "reason" => "unconfirmed").increment(1);
					debug!(broadcaster = %self.id, gift = %gift.name, "gift for unconfirmed session dropped");
					return;
				}

				let notice = GiftNotice {
					broadcaster: self.id.clone(),
					gift_name: gift.name,
					count: gift.count,
					gifter: gift.gifter,
				};
				match self.gift_tx.try_send(notice) {
					Ok(()) => {}
					Err(TrySendError::Full(notice)) => {
						metrics::counter!("livewatch_gifts_dropped_total", "reason" => "backlog").increment(1);
						debug!(broadcaster = %self.id, gift = %notice.gift_name, "gift backlog full; gift dropped");
					}
					Err(TrySendError::Closed(_)) => {
						warn!(broadcaster = %self.id, "gift delivery task gone; gift dropped");
					}
				}
			}

			SourceEvent::Status(_) => {}
		}
	}

	fn on_disconnected(&mut self) {
		let now = Instant::now();
		let outcome = self
			.deps
			.table
			.with_record(&self.id, |rec| machine::on_disconnected(rec, now, &self.deps.cfg));

		match outcome {
			DisconnectOutcome::Noise => {
				self.deps.table.reelect_host();
				debug!(broadcaster = %self.id, "disconnect before any start; ignored");
			}
			DisconnectOutcome::Aborted(reason) => {
				metrics::counter!("livewatch_end_sequence_aborted_total", "gate" => reason.as_str()).increment(1);
				info!(broadcaster = %self.id, gate = reason.as_str(), "end sequence aborted");
			}
			DisconnectOutcome::Verify { epoch } => {
				debug!(broadcaster = %self.id, epoch, "disconnect passed gates; verifying after settle delay");
				self.spawn_verification(epoch);
			}
		}
	}

	fn spawn_verification(&mut self, epoch: u64) {
		let id = self.id.clone();
		let probe = Arc::clone(&self.deps.probe);
		let settle = self.deps.cfg.settle_delay;
		let timeout = self.deps.cfg.probe_timeout;
		let tx = self.self_tx.clone();

		self.verifications.spawn(async move {
			tokio::time::sleep(settle).await;
			let outcome = probe_live(probe.as_ref(), &id, timeout).await;
			let _ = tx.send(Work::Verified { epoch, outcome });
		});
	}

	async fn on_verified(&mut self, epoch: u64, outcome: ProbeOutcome) {
		let now = Instant::now();
		let verdict = self
			.deps
			.table
			.with_record(&self.id, |rec| machine::on_verified(rec, epoch, outcome, now, &self.deps.cfg));

		match verdict {
			VerifyOutcome::Aborted(reason) => {
				metrics::counter!("livewatch_end_sequence_aborted_total", "gate" => reason.as_str()).increment(1);
				info!(broadcaster = %self.id, gate = reason.as_str(), ?outcome, "end sequence aborted after re-check");
			}
			VerifyOutcome::DispatchEnd => {
				let notice = EndNotice {
					broadcaster: self.id.clone(),
				};
				let delivered = self.deps.dispatcher.end(&notice).await;
				let now = Instant::now();
				self.deps
					.table
					.with_record(&self.id, |rec| machine::on_end_result(rec, delivered, now, &self.deps.cfg));
				self.deps.table.reelect_host();
				if delivered {
					info!(broadcaster = %self.id, "session ended");
				}
			}
		}
	}

	async fn on_reconcile(&mut self, ctx: CycleContext) {
		let now = Instant::now();
		let plan = self
			.deps
			.table
			.with_record(&self.id, |rec| machine::plan_reconcile(rec, &self.id, now, &self.deps.cfg, &ctx));

		if plan.disconnect_stale {
			metrics::counter!("livewatch_stale_disconnects_total").increment(1);
			if plan.close_connection {
				info!(broadcaster = %self.id, "poll probe disagrees with open connection; disconnecting");
				self.send_control(SourceControl::Disconnect {
					broadcaster: self.id.clone(),
				});
			} else {
				info!(broadcaster = %self.id, "poll probe finds confirmed session offline; ending");
			}
			self.on_disconnected();
		}

		if plan.connect {
			let sent = self.send_control(SourceControl::Connect {
				broadcaster: self.id.clone(),
			});
			self.deps
				.table
				.with_record(&self.id, |rec| machine::on_connect_issued(rec, now, sent));
			metrics::counter!("livewatch_connect_attempts_total").increment(1);
			debug!(broadcaster = %self.id, sent, "connect attempt issued");
		}

		if let Some(is_host) = plan.notify_start {
			info!(broadcaster = %self.id, is_host, "poll found confirmed session without start; dispatching");
			self.dispatch_start(is_host).await;
		}
	}

	async fn dispatch_start(&mut self, is_host: bool) {
		let Some(rec) = self.deps.table.get(&self.id) else {
			return;
		};

		let stream_url = rec
			.metadata
			.stream_url
			.clone()
			.unwrap_or_else(|| live_page_url(&self.deps.cfg.stream_url_base, &self.id));
		let notice = StartNotice {
			broadcaster: self.id.clone(),
			is_host,
			stream_url,
			viewer_count: rec.metadata.viewer_count,
			title: rec.metadata.title.clone(),
		};

		let delivered = self.deps.dispatcher.start(&notice).await;
		let now = Instant::now();
		self.deps
			.table
			.with_record(&self.id, |rec| machine::on_start_result(rec, delivered, now));
	}

	/// Fire-and-forget control message; a full or closed channel is logged.
	fn send_control(&self, msg: SourceControl) -> bool {
		match self.deps.control_tx.try_send(msg) {
			Ok(()) => true,
			Err(e) => {
				warn!(broadcaster = %self.id, error = %e, "source control send failed");
				false
			}
		}
	}
}
