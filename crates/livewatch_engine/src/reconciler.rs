#![forbid(unsafe_code)]

//! Poll reconciler.
//!
//! Each cycle probes the broadcasters whose session is confirmed, whether or
//! not the source connection survived, then
//! hands every watched broadcaster a [`CycleContext`] with the freshly
//! elected host. The per-broadcaster decisions are made by the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use livewatch_domain::BroadcasterId;
use livewatch_platform::LiveProbe;

use crate::machine::{CycleContext, ProbeOutcome};
use crate::probe::probe_live;
use crate::store::SessionTable;

/// Probe results gathered off the engine loop.
#[derive(Debug, Default)]
pub(crate) struct CyclePlan {
	pub(crate) probes: HashMap<BroadcasterId, ProbeOutcome>,
}

/// Probe every watched broadcaster with a confirmed session.
pub(crate) async fn prepare_cycle(
	table: Arc<SessionTable>,
	watched: Vec<BroadcasterId>,
	probe: Arc<dyn LiveProbe>,
	timeout: Duration,
) -> CyclePlan {
	let targets: Vec<BroadcasterId> = watched
		.into_iter()
		.filter(|id| {
			table
				.get(id)
				.is_some_and(|rec| rec.connectivity_confirmed)
		})
		.collect();

	let outcomes = join_all(targets.iter().map(|id| probe_live(probe.as_ref(), id, timeout))).await;

	CyclePlan {
		probes: targets.into_iter().zip(outcomes).collect(),
	}
}

/// Re-elect the host and build one context per watched broadcaster.
pub(crate) fn cycle_contexts(
	table: &SessionTable,
	watched: &[BroadcasterId],
	plan: &CyclePlan,
) -> Vec<(BroadcasterId, CycleContext)> {
	let host = table.reelect_host();
	let live_count = table.confirmed_count();

	watched
		.iter()
		.map(|id| {
			let ctx = CycleContext {
				host: host.clone(),
				live_count,
				probe: plan.probes.get(id).copied(),
			};
			(id.clone(), ctx)
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use parking_lot::Mutex;
	use tokio::time::Instant;

	use super::*;

	fn id(s: &str) -> BroadcasterId {
		BroadcasterId::new(s).expect("valid id")
	}

	#[derive(Default)]
	struct CountingProbe {
		not_live: HashSet<BroadcasterId>,
		calls: Mutex<Vec<BroadcasterId>>,
	}

	#[async_trait::async_trait]
	impl LiveProbe for CountingProbe {
		async fn is_live(&self, broadcaster: &BroadcasterId) -> anyhow::Result<bool> {
			self.calls.lock().push(broadcaster.clone());
			if broadcaster.as_str() == "broken" {
				anyhow::bail!("probe exploded");
			}
			Ok(!self.not_live.contains(broadcaster))
		}
	}

	#[tokio::test]
	async fn probes_only_confirmed_sessions() {
		let table = Arc::new(SessionTable::new());
		let now = Instant::now();
		for (name, attached, confirmed) in [
			("alice", true, true),
			("bob", false, true),
			("carol", true, false),
			("broken", true, true),
		] {
			table.with_record(&id(name), |rec| {
				rec.attached = attached;
				rec.connectivity_confirmed = confirmed;
				rec.confirmed_at = confirmed.then_some(now);
			});
		}

		let probe = Arc::new(CountingProbe {
			not_live: HashSet::from([id("alice")]),
			..CountingProbe::default()
		});
		let watched = vec![id("alice"), id("bob"), id("carol"), id("broken"), id("dave")];
		let plan = prepare_cycle(
			Arc::clone(&table),
			watched.clone(),
			probe.clone(),
			Duration::from_secs(1),
		)
		.await;

		assert_eq!(plan.probes.len(), 3);
		assert_eq!(plan.probes.get(&id("alice")), Some(&ProbeOutcome::NotLive));
		assert_eq!(plan.probes.get(&id("bob")), Some(&ProbeOutcome::Live), "detached but confirmed");
		assert_eq!(plan.probes.get(&id("broken")), Some(&ProbeOutcome::Failed));
		assert!(!plan.probes.contains_key(&id("carol")));
		assert_eq!(probe.calls.lock().len(), 3);

		let contexts = cycle_contexts(&table, &watched, &plan);
		assert_eq!(contexts.len(), watched.len());
		let (_, dave) = contexts.iter().find(|(who, _)| who.as_str() == "dave").expect("dave context");
		assert_eq!(dave.probe, None);
		assert_eq!(dave.live_count, 3);
		assert_eq!(dave.host, Some(id("alice")));
	}
}
