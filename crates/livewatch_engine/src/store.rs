#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use livewatch_domain::BroadcasterId;
use livewatch_platform::SessionMetadata;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::host;

/// Where a broadcaster's current session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
	/// Nothing confirmed for the current session.
	#[default]
	Idle,
	/// Connect requested, no confirmation yet.
	Connecting,
	/// Confirmed and the start notification went out.
	ConfirmedNotified,
	/// Re-confirmed after a blip; the start was already sent.
	ConfirmedSuppressed,
	/// Confirmed but the start notification has not been delivered.
	ConfirmedUnnotified,
	/// A disconnect is being checked before an end is sent.
	EndVerifying,
	/// The end notification went out.
	Ended,
}

/// Per-broadcaster dedup and timing state.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
	pub phase: SessionPhase,
	pub connectivity_confirmed: bool,
	pub confirmed_at: Option<Instant>,
	pub start_notified: bool,
	pub end_notified: bool,
	pub end_cooldown_until: Option<Instant>,
	/// When the last end notification was delivered.
	pub last_end_at: Option<Instant>,
	pub last_connect_attempt_at: Option<Instant>,
	pub live_according_to_poll: bool,

	/// A source connection was requested or is open.
	pub attached: bool,
	/// Bumped whenever a pending end verification must be invalidated.
	pub epoch: u64,
	/// When the disconnect under verification arrived.
	pub ending_since: Option<Instant>,
	pub metadata: SessionMetadata,
}

/// Status row exposed to the surrounding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcasterStatus {
	pub is_live: bool,
	pub is_host: bool,
}

#[derive(Debug, Default)]
struct Inner {
	records: HashMap<BroadcasterId, SessionRecord>,
	host: Option<BroadcasterId>,
}

/// Owned table of session records.
///
/// Each record is only mutated from its broadcaster's worker, so the lock
/// here is held for short, synchronous sections and never across an await.
#[derive(Debug, Default)]
pub struct SessionTable {
	inner: RwLock<Inner>,
}

impl SessionTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `f` against the broadcaster's record, creating it on first use.
	pub fn with_record<R>(&self, id: &BroadcasterId, f: impl FnOnce(&mut SessionRecord) -> R) -> R {
		let mut inner = self.inner.write();
		let rec = inner.records.entry(id.clone()).or_default();
		f(rec)
	}

	pub fn get(&self, id: &BroadcasterId) -> Option<SessionRecord> {
		self.inner.read().records.get(id).cloned()
	}

	pub fn remove(&self, id: &BroadcasterId) -> Option<SessionRecord> {
		let mut inner = self.inner.write();
		let removed = inner.records.remove(id);
		if inner.host.as_ref() == Some(id) {
			inner.host = elect(&inner.records);
		}
		removed
	}

	pub fn clear(&self) {
		let mut inner = self.inner.write();
		inner.records.clear();
		inner.host = None;
	}

	pub fn ids(&self) -> Vec<BroadcasterId> {
		self.inner.read().records.keys().cloned().collect()
	}

	/// Broadcasters with a requested or open source connection.
	pub fn attached(&self) -> Vec<BroadcasterId> {
		self.inner
			.read()
			.records
			.iter()
			.filter(|(_, rec)| rec.attached)
			.map(|(id, _)| id.clone())
			.collect()
	}

	/// Confirmed-live broadcasters other than `except`, with their confirmation time.
	pub fn confirmed_peers(&self, except: &BroadcasterId) -> Vec<(BroadcasterId, Instant)> {
		self.inner
			.read()
			.records
			.iter()
			.filter(|(id, _)| *id != except)
			.filter_map(|(id, rec)| confirmed_at(rec).map(|at| (id.clone(), at)))
			.collect()
	}

	pub fn confirmed_count(&self) -> usize {
		self.inner.read().records.values().filter(|rec| confirmed_at(rec).is_some()).count()
	}

	/// Current host, as of the last election.
	pub fn host(&self) -> Option<BroadcasterId> {
		self.inner.read().host.clone()
	}

	/// Re-run host election over the table and remember the result.
	pub fn reelect_host(&self) -> Option<BroadcasterId> {
		let mut inner = self.inner.write();
		let host = elect(&inner.records);
		inner.host = host.clone();
		host
	}

	pub fn snapshot(&self) -> BTreeMap<BroadcasterId, BroadcasterStatus> {
		let inner = self.inner.read();
		let host = elect(&inner.records);
		inner
			.records
			.iter()
			.map(|(id, rec)| {
				let status = BroadcasterStatus {
					is_live: rec.connectivity_confirmed,
					is_host: host.as_ref() == Some(id),
				};
				(id.clone(), status)
			})
			.collect()
	}
}

fn confirmed_at(rec: &SessionRecord) -> Option<Instant> {
	rec.confirmed_at.filter(|_| rec.connectivity_confirmed)
}

fn elect(records: &HashMap<BroadcasterId, SessionRecord>) -> Option<BroadcasterId> {
	host::elect(records.iter().filter_map(|(id, rec)| confirmed_at(rec).map(|at| (id, at))))
}
