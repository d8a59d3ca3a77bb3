#![forbid(unsafe_code)]

//! Session state machine.
//!
//! Every transition is a plain function over a [`SessionRecord`] so the
//! rules can be exercised without channels or timers. Callers decide what to
//! do with the returned outcome (dispatch, spawn a verification, ...) and
//! feed dispatch results back through the `on_*_result` functions.

use livewatch_domain::BroadcasterId;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::host;
use crate::store::{SessionPhase, SessionRecord};

/// Result of a connect confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
	/// First confirmation without a delivered start.
	NotifyStart { is_host: bool },
	/// The start for this session was already sent.
	Reconnected,
}

/// Result of a disconnect signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
	/// No start was ever delivered; nothing to end.
	Noise,
	/// All synchronous gates passed; re-check liveness after the settle delay.
	Verify { epoch: u64 },
	Aborted(EndAbort),
}

/// Why an end sequence stopped short of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAbort {
	AlreadyEnded,
	Cooldown,
	MinDuration,
	StillLive,
	ProbeFailed,
	/// A reconnect or reset happened while the verification was pending.
	Superseded,
}

impl EndAbort {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::AlreadyEnded => "already_ended",
			Self::Cooldown => "cooldown",
			Self::MinDuration => "min_duration",
			Self::StillLive => "still_live",
			Self::ProbeFailed => "probe_failed",
			Self::Superseded => "superseded",
		}
	}
}

/// Outcome of one out-of-band liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
	Live,
	NotLive,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
	DispatchEnd,
	Aborted(EndAbort),
}

/// Cycle-wide facts handed to each broadcaster by the poll reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleContext {
	pub host: Option<BroadcasterId>,
	/// Confirmed-live broadcasters at election time.
	pub live_count: usize,
	/// Present when this broadcaster was probed during the cycle.
	pub probe: Option<ProbeOutcome>,
}

/// Actions the poll reconciler asks for on one broadcaster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
	pub connect: bool,
	/// The poll probe says a confirmed session is over; run the disconnect sequence.
	pub disconnect_stale: bool,
	/// The stale session still holds a source connection to close.
	pub close_connection: bool,
	/// `Some(is_host)` when a start should be dispatched from the poll path.
	pub notify_start: Option<bool>,
}

/// Connect confirmation.
///
/// `peers` are the other confirmed-live broadcasters before this update.
pub fn on_connected(
	rec: &mut SessionRecord,
	id: &BroadcasterId,
	now: Instant,
	peers: &[(BroadcasterId, Instant)],
) -> ConnectOutcome {
	rec.attached = true;
	rec.connectivity_confirmed = true;
	let confirmed_at = *rec.confirmed_at.get_or_insert(now);
	// Any end verification in flight belongs to a connection that is back.
	rec.epoch += 1;
	rec.ending_since = None;

	if rec.start_notified {
		rec.phase = SessionPhase::ConfirmedSuppressed;
		return ConnectOutcome::Reconnected;
	}

	rec.phase = SessionPhase::ConfirmedUnnotified;
	let candidates = peers
		.iter()
		.map(|(peer, at)| (peer, *at))
		.chain(std::iter::once((id, confirmed_at)));
	let is_host = host::elect(candidates).as_ref() == Some(id);
	ConnectOutcome::NotifyStart { is_host }
}

/// Apply the result of a start dispatch (push or poll path).
pub fn on_start_result(rec: &mut SessionRecord, delivered: bool, now: Instant) {
	if !delivered {
		rec.phase = SessionPhase::ConfirmedUnnotified;
		return;
	}

	rec.start_notified = true;
	rec.end_notified = false;
	// An expired cooldown is stale; a running one still guards the next end.
	if rec.end_cooldown_until.is_some_and(|until| now >= until) {
		rec.end_cooldown_until = None;
	}
	rec.phase = SessionPhase::ConfirmedNotified;
}

/// Disconnect signal from the source (or a stale disconnect from the poller).
pub fn on_disconnected(rec: &mut SessionRecord, now: Instant, cfg: &EngineConfig) -> DisconnectOutcome {
	rec.attached = false;

	if !rec.start_notified {
		rec.connectivity_confirmed = false;
		rec.confirmed_at = None;
		rec.ending_since = None;
		rec.epoch += 1;
		if rec.phase != SessionPhase::Ended {
			rec.phase = SessionPhase::Idle;
		}
		return DisconnectOutcome::Noise;
	}

	if rec.phase == SessionPhase::EndVerifying || rec.end_notified {
		return DisconnectOutcome::Aborted(EndAbort::AlreadyEnded);
	}

	if cooldown_active(rec, now, cfg) {
		return DisconnectOutcome::Aborted(EndAbort::Cooldown);
	}

	let long_enough = rec
		.confirmed_at
		.is_some_and(|at| now.saturating_duration_since(at) >= cfg.min_session);
	if !long_enough {
		return DisconnectOutcome::Aborted(EndAbort::MinDuration);
	}

	rec.phase = SessionPhase::EndVerifying;
	rec.ending_since = Some(now);
	rec.epoch += 1;
	DisconnectOutcome::Verify { epoch: rec.epoch }
}

/// Result of the settle-and-reverify probe.
pub fn on_verified(
	rec: &mut SessionRecord,
	epoch: u64,
	outcome: ProbeOutcome,
	now: Instant,
	cfg: &EngineConfig,
) -> VerifyOutcome {
	if rec.epoch != epoch || rec.phase != SessionPhase::EndVerifying {
		return VerifyOutcome::Aborted(EndAbort::Superseded);
	}

	let abort = match outcome {
		ProbeOutcome::Live => Some(EndAbort::StillLive),
		ProbeOutcome::Failed => Some(EndAbort::ProbeFailed),
		ProbeOutcome::NotLive if cooldown_active(rec, now, cfg) => Some(EndAbort::Cooldown),
		ProbeOutcome::NotLive => None,
	};

	match abort {
		Some(reason) => {
			resume_confirmed(rec);
			VerifyOutcome::Aborted(reason)
		}
		None => VerifyOutcome::DispatchEnd,
	}
}

/// Apply the result of an end dispatch.
pub fn on_end_result(rec: &mut SessionRecord, delivered: bool, now: Instant, cfg: &EngineConfig) {
	if !delivered {
		resume_confirmed(rec);
		return;
	}

	let ended_at = rec.ending_since.take().unwrap_or(now);
	rec.end_notified = true;
	rec.end_cooldown_until = Some(ended_at + cfg.end_cooldown);
	rec.last_end_at = Some(now);
	rec.start_notified = false;
	rec.connectivity_confirmed = false;
	rec.confirmed_at = None;
	rec.live_according_to_poll = false;
	rec.metadata = Default::default();
	rec.phase = SessionPhase::Ended;
}

/// The source gave up on a connect attempt.
pub fn on_connect_failed(rec: &mut SessionRecord) {
	rec.attached = false;
	if rec.phase == SessionPhase::Connecting {
		rec.phase = SessionPhase::Idle;
	}
}

/// Record a connect request handed to the source.
pub fn on_connect_issued(rec: &mut SessionRecord, now: Instant, sent: bool) {
	rec.last_connect_attempt_at = Some(now);
	if !sent {
		return;
	}
	rec.attached = true;
	if !rec.connectivity_confirmed {
		rec.phase = SessionPhase::Connecting;
	}
}

/// Gifts only flow for a session whose connectivity was confirmed.
pub fn gift_allowed(rec: &SessionRecord) -> bool {
	rec.connectivity_confirmed
}

/// Poll-path decisions for one broadcaster.
///
/// Never yields an end: ends come only from the disconnect sequence.
pub fn plan_reconcile(
	rec: &mut SessionRecord,
	id: &BroadcasterId,
	now: Instant,
	cfg: &EngineConfig,
	ctx: &CycleContext,
) -> ReconcilePlan {
	match ctx.probe {
		Some(ProbeOutcome::Live) => rec.live_according_to_poll = true,
		Some(ProbeOutcome::NotLive) => rec.live_according_to_poll = false,
		Some(ProbeOutcome::Failed) | None => {}
	}

	// A session left confirmed by a blip has no connection but still counts.
	let disconnect_stale = rec.connectivity_confirmed
		&& rec.phase != SessionPhase::EndVerifying
		&& ctx.probe == Some(ProbeOutcome::NotLive);

	let backoff_elapsed = rec
		.last_connect_attempt_at
		.is_none_or(|at| now.saturating_duration_since(at) >= cfg.connect_backoff);
	// An attempt the source never answered counts as not connected.
	let connected = rec.attached && (rec.connectivity_confirmed || !backoff_elapsed);
	let connect = !disconnect_stale && !connected && backoff_elapsed && rec.phase != SessionPhase::EndVerifying;

	let notify_start = if !disconnect_stale
		&& rec.connectivity_confirmed
		&& !rec.start_notified
		&& rec.phase != SessionPhase::EndVerifying
	{
		let is_host = ctx.host.as_ref() == Some(id);
		(ctx.live_count <= 1 || is_host).then_some(is_host)
	} else {
		None
	};

	ReconcilePlan {
		connect,
		disconnect_stale,
		close_connection: disconnect_stale && rec.attached,
		notify_start,
	}
}

/// The window runs from the disconnect that ended the last session and,
/// for slow deliveries, from the moment that end actually went out.
fn cooldown_active(rec: &SessionRecord, now: Instant, cfg: &EngineConfig) -> bool {
	rec.end_cooldown_until.is_some_and(|until| now < until)
		|| rec.last_end_at.is_some_and(|at| now < at + cfg.end_cooldown)
}

fn resume_confirmed(rec: &mut SessionRecord) {
	rec.ending_since = None;
	rec.phase = if rec.start_notified {
		SessionPhase::ConfirmedNotified
	} else {
		SessionPhase::ConfirmedUnnotified
	};
}
