#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use livewatch_domain::{BroadcasterId, WatchedBroadcaster};
use livewatch_notify::NotificationSink;
use livewatch_platform::{
	LiveProbe, SignalSource, SourceControl, SourceControlTx, SourceEvent, SourceEventRx, bounded_source_channels,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::EngineError;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::reconciler::{CyclePlan, cycle_contexts, prepare_cycle};
use crate::store::{BroadcasterStatus, SessionRecord, SessionTable};
use crate::worker::{self, Work, WorkerDeps, WorkerHandle};

/// Live session reconciliation engine.
///
/// Owns the session table and, while running, a source task, a poll timer
/// and one worker per observed broadcaster.
pub struct Engine {
	cfg: Arc<EngineConfig>,
	source: Arc<dyn SignalSource>,
	probe: Arc<dyn LiveProbe>,
	table: Arc<SessionTable>,
	watched: Arc<RwLock<BTreeSet<BroadcasterId>>>,
	running: Arc<AtomicBool>,
	run: Mutex<Option<RunHandle>>,
}

struct RunHandle {
	shutdown_tx: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

impl Engine {
	pub fn new(cfg: EngineConfig, source: Arc<dyn SignalSource>, probe: Arc<dyn LiveProbe>) -> Self {
		Self {
			cfg: Arc::new(cfg),
			source,
			probe,
			table: Arc::new(SessionTable::new()),
			watched: Arc::new(RwLock::new(BTreeSet::new())),
			running: Arc::new(AtomicBool::new(false)),
			run: Mutex::new(None),
		}
	}

	/// Start monitoring `watch_list`, delivering notifications to `sink`.
	///
	/// Begins from an empty session table.
	pub fn start(&self, watch_list: Vec<WatchedBroadcaster>, sink: Arc<dyn NotificationSink>) -> Result<(), EngineError> {
		let mut run = self.run.lock();
		if run.is_some() {
			return Err(EngineError::AlreadyRunning);
		}

		{
			let mut watched = self.watched.write();
			watched.clear();
			watched.extend(watch_list.into_iter().map(|w| w.id));
		}
		self.table.clear();

		let (control_tx, control_rx, events_tx, events_rx) =
			bounded_source_channels(self.cfg.control_channel_capacity, self.cfg.events_channel_capacity);

		let source = Arc::clone(&self.source);
		let source_name = source.name();
		let source_task = tokio::spawn(async move {
			if let Err(e) = source.run(control_rx, events_tx).await {
				warn!(source = source_name, error = %e, "signal source exited with error");
			}
		});

		let run_loop = RunLoop {
			cfg: Arc::clone(&self.cfg),
			table: Arc::clone(&self.table),
			watched: Arc::clone(&self.watched),
			probe: Arc::clone(&self.probe),
			deps: WorkerDeps {
				cfg: Arc::clone(&self.cfg),
				table: Arc::clone(&self.table),
				dispatcher: Dispatcher::new(sink),
				probe: Arc::clone(&self.probe),
				control_tx: control_tx.clone(),
			},
			control_tx,
			workers: HashMap::new(),
		};

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(run_loop.run(events_rx, source_task, shutdown_rx));

		*run = Some(RunHandle { shutdown_tx, task });
		self.running.store(true, Ordering::Release);
		info!(source = source_name, watched = self.watched.read().len(), "engine started");
		Ok(())
	}

	/// Stop monitoring: disconnect everything, drop pending verifications and
	/// clear all session records.
	pub async fn stop(&self) -> Result<(), EngineError> {
		let Some(handle) = self.run.lock().take() else {
			return Err(EngineError::NotRunning);
		};

		let _ = handle.shutdown_tx.send(());
		if let Err(e) = handle.task.await {
			error!(error = %e, "engine run loop failed");
			self.table.clear();
		}

		self.running.store(false, Ordering::Release);
		info!("engine stopped");
		Ok(())
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// Add a broadcaster; takes effect on the next poll cycle.
	pub fn watch(&self, id: BroadcasterId) -> bool {
		let added = self.watched.write().insert(id.clone());
		if added {
			info!(broadcaster = %id, "broadcaster watched");
		}
		added
	}

	/// Remove a broadcaster; the next poll cycle disconnects it and drops its record.
	pub fn unwatch(&self, id: &BroadcasterId) -> bool {
		let removed = self.watched.write().remove(id);
		if removed {
			info!(broadcaster = %id, "broadcaster unwatched");
		}
		removed
	}

	pub fn watch_list(&self) -> Vec<BroadcasterId> {
		self.watched.read().iter().cloned().collect()
	}

	/// Current record for one broadcaster, if it has been observed.
	pub fn session(&self, id: &BroadcasterId) -> Option<SessionRecord> {
		self.table.get(id)
	}

	/// Live/host status for every watched broadcaster.
	pub fn snapshot(&self) -> BTreeMap<BroadcasterId, BroadcasterStatus> {
		let mut statuses = self.table.snapshot();
		let watched = self.watched.read();
		statuses.retain(|id, _| watched.contains(id));
		for id in watched.iter() {
			statuses.entry(id.clone()).or_default();
		}
		statuses
	}
}

struct RunLoop {
	cfg: Arc<EngineConfig>,
	table: Arc<SessionTable>,
	watched: Arc<RwLock<BTreeSet<BroadcasterId>>>,
	probe: Arc<dyn LiveProbe>,
	deps: WorkerDeps,
	control_tx: SourceControlTx,
	workers: HashMap<BroadcasterId, WorkerHandle>,
}

impl RunLoop {
	async fn run(
		mut self,
		mut events_rx: SourceEventRx,
		mut source_task: JoinHandle<()>,
		mut shutdown_rx: oneshot::Receiver<()>,
	) {
		let (plan_tx, mut plan_rx) = mpsc::channel::<CyclePlan>(1);
		let mut ticker = tokio::time::interval(self.cfg.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut cycle_in_flight = false;
		let mut source_open = true;

		loop {
			tokio::select! {
				_ = &mut shutdown_rx => {
					debug!("engine observed shutdown");
					break;
				}

				ev = events_rx.recv(), if source_open => {
					let Some(ev) = ev else {
						warn!("signal source event channel closed");
						source_open = false;
						continue;
					};
					self.route_event(ev);
				}

				_ = ticker.tick() => {
					if cycle_in_flight {
						debug!("previous poll cycle still running; skipping tick");
						continue;
					}
					cycle_in_flight = true;
					let watched = self.watched_ids();
					let table = Arc::clone(&self.table);
					let probe = Arc::clone(&self.probe);
					let timeout = self.cfg.probe_timeout;
					let plan_tx = plan_tx.clone();
					tokio::spawn(async move {
						let plan = prepare_cycle(table, watched, probe, timeout).await;
						let _ = plan_tx.send(plan).await;
					});
				}

				Some(plan) = plan_rx.recv() => {
					cycle_in_flight = false;
					self.apply_cycle(plan);
				}
			}
		}

		self.shutdown(events_rx, &mut source_task).await;
	}

	fn watched_ids(&self) -> Vec<BroadcasterId> {
		self.watched.read().iter().cloned().collect()
	}

	fn route_event(&mut self, ev: SourceEvent) {
		if let SourceEvent::Status(st) = &ev {
			metrics::counter!("livewatch_source_status_total").increment(1);
			debug!(
				source = st.source,
				connected = st.connected,
				detail = %st.detail,
				last_error = ?st.last_error,
				"source status"
			);
			return;
		}

		let Some(id) = ev.broadcaster().cloned() else {
			return;
		};
		if !self.watched.read().contains(&id) {
			debug!(broadcaster = %id, kind = ev.kind(), "event for unwatched broadcaster ignored");
			return;
		}

		if self.worker(&id).tx.send(Work::Source(ev)).is_err() {
			warn!(broadcaster = %id, "worker queue closed; event dropped");
		}
	}

	fn worker(&mut self, id: &BroadcasterId) -> &WorkerHandle {
		self.workers
			.entry(id.clone())
			.or_insert_with(|| worker::spawn(id.clone(), self.deps.clone()))
	}

	fn apply_cycle(&mut self, plan: CyclePlan) {
		let watched = self.watched.read().clone();

		let mut gone: BTreeSet<BroadcasterId> = self.table.ids().into_iter().collect();
		gone.extend(self.workers.keys().cloned());
		gone.retain(|id| !watched.contains(id));
		for id in gone {
			self.forget(&id);
		}

		let watched: Vec<BroadcasterId> = watched.into_iter().collect();
		for (id, ctx) in cycle_contexts(&self.table, &watched, &plan) {
			if self.worker(&id).tx.send(Work::Reconcile(ctx)).is_err() {
				warn!(broadcaster = %id, "worker queue closed; skipping poll cycle");
			}
		}

		metrics::counter!("livewatch_poll_cycles_total").increment(1);
		metrics::gauge!("livewatch_live_broadcasters").set(self.table.confirmed_count() as f64);
		debug!(watched = watched.len(), probed = plan.probes.len(), "poll cycle applied");
	}

	/// Drop an unwatched broadcaster: disconnect, stop its worker, discard its record.
	fn forget(&mut self, id: &BroadcasterId) {
		if let Some(handle) = self.workers.remove(id) {
			handle.abort();
		}
		let attached = self.table.remove(id).is_some_and(|rec| rec.attached);
		if attached {
			let _ = self.control_tx.try_send(SourceControl::Disconnect {
				broadcaster: id.clone(),
			});
		}
		info!(broadcaster = %id, "broadcaster removed from monitoring");
	}

	async fn shutdown(mut self, events_rx: SourceEventRx, source_task: &mut JoinHandle<()>) {
		for (_, handle) in self.workers.drain() {
			handle.abort();
		}

		// Nothing routes events any more; let the source's sends fail fast.
		drop(events_rx);

		for id in self.table.attached() {
			let _ = self.control_tx.try_send(SourceControl::Disconnect { broadcaster: id });
		}
		let shutdown_sent = tokio::time::timeout(self.cfg.shutdown_grace, self.control_tx.send(SourceControl::Shutdown)).await;
		if !matches!(shutdown_sent, Ok(Ok(()))) {
			debug!("source did not accept shutdown request");
		}
		self.table.clear();

		if tokio::time::timeout(self.cfg.shutdown_grace, &mut *source_task).await.is_err() {
			warn!("signal source did not stop in time; aborting");
			source_task.abort();
		}
	}
}
