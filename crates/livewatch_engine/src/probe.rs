#![forbid(unsafe_code)]

use std::time::Duration;

use livewatch_domain::BroadcasterId;
use livewatch_platform::LiveProbe;
use tracing::warn;

use crate::machine::ProbeOutcome;

/// Run one bounded liveness check. Errors and timeouts map to `Failed`.
pub(crate) async fn probe_live(probe: &dyn LiveProbe, id: &BroadcasterId, timeout: Duration) -> ProbeOutcome {
	match tokio::time::timeout(timeout, probe.is_live(id)).await {
		Ok(Ok(true)) => ProbeOutcome::Live,
		Ok(Ok(false)) => ProbeOutcome::NotLive,
		Ok(Err(e)) => {
			metrics::counter!("livewatch_probe_failures_total").increment(1);
			warn!(broadcaster = %id, error = %e, "liveness probe failed");
			ProbeOutcome::Failed
		}
		Err(_) => {
			metrics::counter!("livewatch_probe_failures_total").increment(1);
			warn!(broadcaster = %id, ?timeout, "liveness probe timed out");
			ProbeOutcome::Failed
		}
	}
}
