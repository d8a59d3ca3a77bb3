#![forbid(unsafe_code)]

use std::sync::Arc;

use livewatch_notify::{EndNotice, GiftNotice, NotificationSink, NotifyError, StartNotice};
use tracing::{info, warn};

/// Stateless bridge from notification intents to the sink.
///
/// Returns whether delivery succeeded; dedup bookkeeping stays with the
/// state machine.
#[derive(Clone)]
pub struct Dispatcher {
	sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
	pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
		Self { sink }
	}

	pub async fn start(&self, notice: &StartNotice) -> bool {
		let result = self.sink.emit_start(notice).await;
		record("start", notice.broadcaster.as_str(), result)
	}

	pub async fn end(&self, notice: &EndNotice) -> bool {
		let result = self.sink.emit_end(notice).await;
		record("end", notice.broadcaster.as_str(), result)
	}

	pub async fn gift(&self, notice: &GiftNotice) -> bool {
		let result = self.sink.emit_gift(notice).await;
		record("gift", notice.broadcaster.as_str(), result)
	}
}

fn record(kind: &'static str, broadcaster: &str, result: Result<(), NotifyError>) -> bool {
	match result {
		Ok(()) => {
			metrics::counter!("livewatch_notifications_total", "kind" => kind, "outcome" => "delivered").increment(1);
			info!(broadcaster, kind, "notification delivered");
			true
		}
		Err(e) => {
			metrics::counter!("livewatch_notifications_total", "kind" => kind, "outcome" => "failed").increment(1);
			warn!(broadcaster, kind, error = %e, "notification failed");
			false
		}
	}
}
