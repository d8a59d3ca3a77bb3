#![forbid(unsafe_code)]

use std::time::Duration;

use livewatch_domain::BroadcasterId;
use proptest::prelude::*;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::machine::{
	ConnectOutcome, CycleContext, DisconnectOutcome, EndAbort, ProbeOutcome, VerifyOutcome, gift_allowed,
	on_connect_failed, on_connect_issued, on_connected, on_disconnected, on_end_result, on_start_result, on_verified,
	plan_reconcile,
};
use crate::store::{SessionPhase, SessionRecord};

fn id(s: &str) -> BroadcasterId {
	BroadcasterId::new(s).expect("valid id")
}

fn secs(n: u64) -> Duration {
	Duration::from_secs(n)
}

fn lone_ctx(who: &BroadcasterId, probe: Option<ProbeOutcome>) -> CycleContext {
	CycleContext {
		host: Some(who.clone()),
		live_count: 1,
		probe,
	}
}

/// Confirmed and start delivered at `at`.
fn live_record(who: &BroadcasterId, at: Instant) -> SessionRecord {
	let mut rec = SessionRecord::default();
	assert_eq!(
		on_connected(&mut rec, who, at, &[]),
		ConnectOutcome::NotifyStart { is_host: true }
	);
	on_start_result(&mut rec, true, at);
	rec
}

#[test]
fn alice_session_walkthrough() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");

	let mut rec = live_record(&alice, t0);
	assert!(rec.start_notified);
	assert_eq!(rec.phase, SessionPhase::ConfirmedNotified);

	// t=10: blip inside the minimum duration.
	assert_eq!(
		on_disconnected(&mut rec, t0 + secs(10), &cfg),
		DisconnectOutcome::Aborted(EndAbort::MinDuration)
	);
	assert!(rec.connectivity_confirmed, "blip keeps the broadcaster live");
	assert!(rec.start_notified);

	// t=12: reconnect is not a new session.
	assert_eq!(on_connected(&mut rec, &alice, t0 + secs(12), &[]), ConnectOutcome::Reconnected);
	assert_eq!(rec.phase, SessionPhase::ConfirmedSuppressed);
	assert_eq!(rec.confirmed_at, Some(t0));

	// t=50: genuine end.
	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(50), &cfg) else {
		panic!("expected verification");
	};
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(55), &cfg),
		VerifyOutcome::DispatchEnd
	);
	on_end_result(&mut rec, true, t0 + secs(55), &cfg);

	assert!(!rec.start_notified);
	assert!(rec.end_notified);
	assert!(!rec.connectivity_confirmed);
	assert_eq!(rec.end_cooldown_until, Some(t0 + secs(110)));
	assert_eq!(rec.phase, SessionPhase::Ended);
}

#[test]
fn disconnect_before_any_start_is_noise() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = SessionRecord::default();

	assert_eq!(on_disconnected(&mut rec, t0, &cfg), DisconnectOutcome::Noise);

	// Confirmed, start failed, then dropped: still noise.
	on_connected(&mut rec, &alice, t0, &[]);
	on_start_result(&mut rec, false, t0);
	assert_eq!(on_disconnected(&mut rec, t0 + secs(120), &cfg), DisconnectOutcome::Noise);
	assert!(!rec.connectivity_confirmed);
	assert_eq!(rec.confirmed_at, None);
	assert_eq!(rec.phase, SessionPhase::Idle);
}

#[test]
fn failed_start_is_retried_on_reconnect() {
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = SessionRecord::default();

	assert!(matches!(on_connected(&mut rec, &alice, t0, &[]), ConnectOutcome::NotifyStart { .. }));
	on_start_result(&mut rec, false, t0);
	assert!(!rec.start_notified);
	assert_eq!(rec.phase, SessionPhase::ConfirmedUnnotified);

	assert!(matches!(
		on_connected(&mut rec, &alice, t0 + secs(3), &[]),
		ConnectOutcome::NotifyStart { .. }
	));
	on_start_result(&mut rec, true, t0 + secs(3));
	assert!(rec.start_notified);
	assert_eq!(rec.confirmed_at, Some(t0), "confirmation time is kept across retries");
}

#[test]
fn push_path_host_uses_peers_before_update() {
	let t0 = Instant::now();
	let bob = id("bob");
	let carol = id("carol");

	let mut bob_rec = SessionRecord::default();
	assert_eq!(
		on_connected(&mut bob_rec, &bob, t0, &[]),
		ConnectOutcome::NotifyStart { is_host: true }
	);

	let mut carol_rec = SessionRecord::default();
	assert_eq!(
		on_connected(&mut carol_rec, &carol, t0 + secs(5), &[(bob.clone(), t0)]),
		ConnectOutcome::NotifyStart { is_host: false }
	);
}

#[test]
fn reconnect_during_settle_supersedes_verification() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = live_record(&alice, t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
		panic!("expected verification");
	};
	assert_eq!(on_connected(&mut rec, &alice, t0 + secs(42), &[]), ConnectOutcome::Reconnected);
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(45), &cfg),
		VerifyOutcome::Aborted(EndAbort::Superseded)
	);
	assert!(rec.start_notified);
}

#[test]
fn duplicate_disconnect_while_verifying_is_ignored() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let mut rec = live_record(&id("alice"), t0);

	assert!(matches!(
		on_disconnected(&mut rec, t0 + secs(40), &cfg),
		DisconnectOutcome::Verify { .. }
	));
	assert_eq!(
		on_disconnected(&mut rec, t0 + secs(41), &cfg),
		DisconnectOutcome::Aborted(EndAbort::AlreadyEnded)
	);
}

#[test]
fn live_or_failed_probe_aborts_and_keeps_session() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();

	for (outcome, reason) in [
		(ProbeOutcome::Live, EndAbort::StillLive),
		(ProbeOutcome::Failed, EndAbort::ProbeFailed),
	] {
		let mut rec = live_record(&id("alice"), t0);
		let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
			panic!("expected verification");
		};
		assert_eq!(
			on_verified(&mut rec, epoch, outcome, t0 + secs(45), &cfg),
			VerifyOutcome::Aborted(reason)
		);
		assert_eq!(rec.phase, SessionPhase::ConfirmedNotified);
		assert!(rec.connectivity_confirmed);
		assert!(rec.start_notified);
	}
}

#[test]
fn failed_end_dispatch_leaves_flags_unset() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let mut rec = live_record(&id("alice"), t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
		panic!("expected verification");
	};
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(45), &cfg),
		VerifyOutcome::DispatchEnd
	);
	on_end_result(&mut rec, false, t0 + secs(45), &cfg);

	assert!(!rec.end_notified);
	assert!(rec.start_notified);
	assert_eq!(rec.end_cooldown_until, None);

	// A later disconnect can retry the end.
	on_connected(&mut rec, &id("alice"), t0 + secs(60), &[]);
	assert!(matches!(
		on_disconnected(&mut rec, t0 + secs(70), &cfg),
		DisconnectOutcome::Verify { .. }
	));
}

#[test]
fn cooldown_suppresses_end_for_next_session() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = live_record(&alice, t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
		panic!("expected verification");
	};
	on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(45), &cfg);
	on_end_result(&mut rec, true, t0 + secs(45), &cfg);
	let cooldown_until = t0 + secs(100);
	assert_eq!(rec.end_cooldown_until, Some(cooldown_until));

	// New session inside the cooldown window. The start goes out but the
	// running cooldown survives it.
	assert!(matches!(
		on_connected(&mut rec, &alice, t0 + secs(50), &[]),
		ConnectOutcome::NotifyStart { .. }
	));
	on_start_result(&mut rec, true, t0 + secs(50));
	assert!(!rec.end_notified);
	assert_eq!(rec.end_cooldown_until, Some(cooldown_until));

	assert_eq!(
		on_disconnected(&mut rec, t0 + secs(90), &cfg),
		DisconnectOutcome::Aborted(EndAbort::Cooldown)
	);
}

#[test]
fn expired_cooldown_is_cleared_by_next_start() {
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = SessionRecord {
		end_notified: true,
		end_cooldown_until: Some(t0 + secs(60)),
		phase: SessionPhase::Ended,
		..SessionRecord::default()
	};

	on_connected(&mut rec, &alice, t0 + secs(61), &[]);
	on_start_result(&mut rec, true, t0 + secs(61));
	assert_eq!(rec.end_cooldown_until, None);
	assert!(!rec.end_notified);
}

#[test]
fn cooldown_is_checked_again_at_dispatch_gate() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let mut rec = live_record(&id("alice"), t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
		panic!("expected verification");
	};
	// Cooldown appears while the verification is pending.
	rec.end_cooldown_until = Some(t0 + secs(100));
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(45), &cfg),
		VerifyOutcome::Aborted(EndAbort::Cooldown)
	);
}

#[test]
fn slow_end_delivery_extends_cooldown_from_delivery() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = live_record(&alice, t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(50), &cfg) else {
		panic!("expected verification");
	};
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(55), &cfg),
		VerifyOutcome::DispatchEnd
	);
	// The sink takes eight seconds to accept the end.
	on_end_result(&mut rec, true, t0 + secs(63), &cfg);
	assert_eq!(rec.end_cooldown_until, Some(t0 + secs(110)));
	assert_eq!(rec.last_end_at, Some(t0 + secs(63)));

	// Next session is long enough but ends 49s after the delivered end.
	on_connected(&mut rec, &alice, t0 + secs(70), &[]);
	on_start_result(&mut rec, true, t0 + secs(70));
	assert_eq!(
		on_disconnected(&mut rec, t0 + secs(112), &cfg),
		DisconnectOutcome::Aborted(EndAbort::Cooldown)
	);
	assert!(rec.start_notified, "suppressed end keeps the session live");

	// Sixty seconds after delivery the next end goes through.
	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(123), &cfg) else {
		panic!("expected verification");
	};
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(128), &cfg),
		VerifyOutcome::DispatchEnd
	);
}

#[test]
fn delivery_cooldown_is_checked_at_dispatch_gate() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let mut rec = live_record(&id("alice"), t0);

	let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut rec, t0 + secs(40), &cfg) else {
		panic!("expected verification");
	};
	rec.last_end_at = Some(t0 + secs(10));
	assert_eq!(
		on_verified(&mut rec, epoch, ProbeOutcome::NotLive, t0 + secs(45), &cfg),
		VerifyOutcome::Aborted(EndAbort::Cooldown)
	);
	assert_eq!(rec.phase, SessionPhase::ConfirmedNotified);
}

#[test]
fn gifts_need_confirmed_connectivity() {
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = SessionRecord::default();
	assert!(!gift_allowed(&rec));

	on_connected(&mut rec, &alice, t0, &[]);
	assert!(gift_allowed(&rec));
}

#[test]
fn connect_failure_returns_to_idle() {
	let t0 = Instant::now();
	let mut rec = SessionRecord::default();
	on_connect_issued(&mut rec, t0, true);
	assert!(rec.attached);
	assert_eq!(rec.phase, SessionPhase::Connecting);

	on_connect_failed(&mut rec);
	assert!(!rec.attached);
	assert_eq!(rec.phase, SessionPhase::Idle);
	assert_eq!(rec.last_connect_attempt_at, Some(t0));
}

#[test]
fn reconcile_respects_connect_backoff() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let ctx = lone_ctx(&alice, None);
	let mut rec = SessionRecord::default();

	assert!(plan_reconcile(&mut rec, &alice, t0, &cfg, &ctx).connect);
	on_connect_issued(&mut rec, t0, true);
	on_connect_failed(&mut rec);

	assert!(!plan_reconcile(&mut rec, &alice, t0 + secs(10), &cfg, &ctx).connect);
	assert!(plan_reconcile(&mut rec, &alice, t0 + secs(15), &cfg, &ctx).connect);
}

#[test]
fn reconcile_retries_an_unanswered_connect() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let ctx = lone_ctx(&alice, None);
	let mut rec = SessionRecord::default();

	on_connect_issued(&mut rec, t0, true);
	assert!(!plan_reconcile(&mut rec, &alice, t0 + secs(5), &cfg, &ctx).connect);
	assert!(plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &ctx).connect);
}

#[test]
fn reconcile_reconnects_after_blip_but_not_while_attached() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let ctx = lone_ctx(&alice, Some(ProbeOutcome::Live));
	let mut rec = live_record(&alice, t0);

	let plan = plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &ctx);
	assert!(!plan.connect);
	assert!(rec.live_according_to_poll);

	on_disconnected(&mut rec, t0 + secs(10), &cfg);
	let plan = plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &ctx);
	assert!(plan.connect);
	assert_eq!(plan.notify_start, None);
}

#[test]
fn reconcile_drops_stale_connection() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = live_record(&alice, t0);

	let plan = plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &lone_ctx(&alice, Some(ProbeOutcome::NotLive)));
	assert!(plan.disconnect_stale);
	assert!(plan.close_connection);
	assert!(!plan.connect);
	assert!(!rec.live_according_to_poll);

	let plan = plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &lone_ctx(&alice, Some(ProbeOutcome::Failed)));
	assert!(!plan.disconnect_stale);
}

#[test]
fn reconcile_ends_detached_session_the_poll_finds_offline() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");
	let mut rec = live_record(&alice, t0);

	// Blip: the connection is gone but the session stays confirmed.
	on_disconnected(&mut rec, t0 + secs(10), &cfg);
	assert!(!rec.attached);

	let plan = plan_reconcile(&mut rec, &alice, t0 + secs(30), &cfg, &lone_ctx(&alice, Some(ProbeOutcome::NotLive)));
	assert!(plan.disconnect_stale);
	assert!(!plan.close_connection, "nothing to close");
	assert!(!plan.connect);
	assert!(matches!(
		on_disconnected(&mut rec, t0 + secs(30), &cfg),
		DisconnectOutcome::Verify { .. }
	));
}

#[test]
fn reconcile_start_follows_host_restriction() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let bob = id("bob");
	let carol = id("carol");

	let mut carol_rec = SessionRecord::default();
	on_connected(&mut carol_rec, &carol, t0, &[]);
	on_start_result(&mut carol_rec, false, t0);

	let two_live = |host: &BroadcasterId| CycleContext {
		host: Some(host.clone()),
		live_count: 2,
		probe: None,
	};

	let plan = plan_reconcile(&mut carol_rec, &carol, t0 + secs(30), &cfg, &two_live(&bob));
	assert_eq!(plan.notify_start, None, "non-host is suppressed while several are live");

	let plan = plan_reconcile(&mut carol_rec, &carol, t0 + secs(30), &cfg, &two_live(&carol));
	assert_eq!(plan.notify_start, Some(true));

	let plan = plan_reconcile(&mut carol_rec, &carol, t0 + secs(30), &cfg, &lone_ctx(&carol, None));
	assert_eq!(plan.notify_start, Some(true));
}

#[test]
fn reconcile_never_starts_unconfirmed_or_notified() {
	let cfg = EngineConfig::default();
	let t0 = Instant::now();
	let alice = id("alice");

	let mut fresh = SessionRecord::default();
	let plan = plan_reconcile(&mut fresh, &alice, t0, &cfg, &lone_ctx(&alice, Some(ProbeOutcome::Live)));
	assert_eq!(plan.notify_start, None);

	let mut notified = live_record(&alice, t0);
	let plan = plan_reconcile(&mut notified, &alice, t0, &cfg, &lone_ctx(&alice, Some(ProbeOutcome::Live)));
	assert_eq!(plan.notify_start, None);
}

#[derive(Debug, Clone)]
enum Op {
	Advance(u64),
	Connected { delivered: bool },
	Disconnected,
	/// `latency` seconds pass between the re-check and the end delivery.
	Verified { outcome: ProbeOutcome, delivered: bool, latency: u64 },
	Poll { probe: Option<ProbeOutcome>, delivered: bool },
	ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
	Start,
	End,
}

fn probe_outcome() -> impl Strategy<Value = ProbeOutcome> {
	prop_oneof![
		Just(ProbeOutcome::Live),
		Just(ProbeOutcome::NotLive),
		Just(ProbeOutcome::Failed),
	]
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u64..90).prop_map(Op::Advance),
		any::<bool>().prop_map(|delivered| Op::Connected { delivered }),
		Just(Op::Disconnected),
		(probe_outcome(), any::<bool>(), 0u64..20)
			.prop_map(|(outcome, delivered, latency)| Op::Verified { outcome, delivered, latency }),
		(proptest::option::of(probe_outcome()), any::<bool>()).prop_map(|(probe, delivered)| Op::Poll { probe, delivered }),
		Just(Op::ConnectFailed),
	]
}

struct Driver {
	cfg: EngineConfig,
	id: BroadcasterId,
	rec: SessionRecord,
	now: Instant,
	pending: Vec<u64>,
	sent: Vec<(Sent, Instant)>,
	/// Cooldown deadline recorded after each delivered end.
	cooldowns: Vec<Instant>,
}

impl Driver {
	fn new() -> Self {
		Self {
			cfg: EngineConfig::default(),
			id: id("alice"),
			rec: SessionRecord::default(),
			now: Instant::now(),
			pending: Vec::new(),
			sent: Vec::new(),
			cooldowns: Vec::new(),
		}
	}

	fn start_result(&mut self, delivered: bool) {
		assert!(self.rec.connectivity_confirmed, "start for an unconfirmed session");
		if delivered {
			self.sent.push((Sent::Start, self.now));
		}
		on_start_result(&mut self.rec, delivered, self.now);
	}

	fn disconnect(&mut self) {
		if let DisconnectOutcome::Verify { epoch } = on_disconnected(&mut self.rec, self.now, &self.cfg) {
			self.pending.push(epoch);
		}
	}

	fn apply(&mut self, op: Op) {
		match op {
			Op::Advance(s) => self.now += secs(s),
			Op::Connected { delivered } => {
				if let ConnectOutcome::NotifyStart { .. } = on_connected(&mut self.rec, &self.id, self.now, &[]) {
					self.start_result(delivered);
				}
			}
			Op::Disconnected => self.disconnect(),
			Op::Verified {
				outcome,
				delivered,
				latency,
			} => {
				if self.pending.is_empty() {
					return;
				}
				let epoch = self.pending.remove(0);
				if on_verified(&mut self.rec, epoch, outcome, self.now, &self.cfg) == VerifyOutcome::DispatchEnd {
					self.now += secs(latency);
					if delivered {
						self.sent.push((Sent::End, self.now));
					}
					on_end_result(&mut self.rec, delivered, self.now, &self.cfg);
					if delivered {
						self.cooldowns.extend(self.rec.end_cooldown_until);
					}
				}
			}
			Op::Poll { probe, delivered } => {
				let ctx = lone_ctx(&self.id, probe);
				let plan = plan_reconcile(&mut self.rec, &self.id, self.now, &self.cfg, &ctx);
				if plan.disconnect_stale {
					self.disconnect();
				}
				if plan.connect {
					on_connect_issued(&mut self.rec, self.now, true);
				}
				if plan.notify_start.is_some() {
					self.start_result(delivered);
				}
			}
			Op::ConnectFailed => on_connect_failed(&mut self.rec),
		}
	}
}

proptest! {
	#[test]
	fn starts_and_ends_alternate(ops in proptest::collection::vec(op(), 1..80)) {
		let mut driver = Driver::new();
		for op in ops {
			driver.apply(op);
		}

		let mut expected = Sent::Start;
		for (kind, _) in &driver.sent {
			prop_assert_eq!(*kind, expected, "sequence {:?}", driver.sent);
			expected = match kind {
				Sent::Start => Sent::End,
				Sent::End => Sent::Start,
			};
		}
	}

	#[test]
	fn ends_respect_cooldown(ops in proptest::collection::vec(op(), 1..80)) {
		let mut driver = Driver::new();
		for op in ops {
			driver.apply(op);
		}

		let ends: Vec<Instant> = driver
			.sent
			.iter()
			.filter(|(kind, _)| *kind == Sent::End)
			.map(|(_, at)| *at)
			.collect();
		for (i, end) in ends.iter().enumerate().skip(1) {
			prop_assert!(*end >= driver.cooldowns[i - 1], "end inside cooldown window");
			prop_assert!(*end >= ends[i - 1] + driver.cfg.end_cooldown, "ends closer than the cooldown");
		}
	}
}
