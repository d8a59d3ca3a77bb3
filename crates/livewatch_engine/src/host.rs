#![forbid(unsafe_code)]

//! Host election.
//!
//! The host is the confirmed-live broadcaster that went live first. Ties on
//! the confirmation instant are broken by id so the result never depends on
//! iteration order.

use livewatch_domain::BroadcasterId;
use tokio::time::Instant;

/// Elect the host among `(id, confirmed_at)` candidates.
pub fn elect<'a, I>(candidates: I) -> Option<BroadcasterId>
where
	I: IntoIterator<Item = (&'a BroadcasterId, Instant)>,
{
	candidates
		.into_iter()
		.min_by(|(a_id, a_at), (b_id, b_at)| a_at.cmp(b_at).then_with(|| a_id.cmp(b_id)))
		.map(|(id, _)| id.clone())
}
