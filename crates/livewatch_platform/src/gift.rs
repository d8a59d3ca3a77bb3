#![forbid(unsafe_code)]

//! Boundary normalization for gift payloads.
//!
//! Upstream connectors deliver gifts in several shapes (snake_case,
//! camelCase, nested `gift` object or flat). Everything is mapped to one
//! [`GiftEvent`] here so the engine never probes payload fields itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder used when no usable gift name is present.
pub const GENERIC_GIFT_NAME: &str = "Gift";

const NAME_KEYS: &[&str] = &["name", "gift_name", "giftName"];
const ID_KEYS: &[&str] = &["giftId", "gift_id"];
const COUNT_KEYS: &[&str] = &["repeat_count", "repeatCount", "count", "amount"];
const GIFTER_KEYS: &[&str] = &["unique_id", "uniqueId", "nickname", "name"];

/// Normalized gift event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftEvent {
	pub name: String,
	pub count: u64,
	#[serde(default)]
	pub gifter: Option<String>,
}

impl GiftEvent {
	pub fn new(name: impl Into<String>, count: u64, gifter: Option<String>) -> Self {
		let name = name.into();
		let name = if name.trim().is_empty() {
			GENERIC_GIFT_NAME.to_string()
		} else {
			name.trim().to_string()
		};
		Self {
			name,
			count: count.max(1),
			gifter: gifter.map(|g| g.trim().to_string()).filter(|g| !g.is_empty()),
		}
	}

	/// Whether the name is the generic placeholder.
	pub fn is_generic(&self) -> bool {
		self.name == GENERIC_GIFT_NAME
	}
}

/// Map a heterogeneous gift payload into a [`GiftEvent`].
///
/// Push connectors call this on every raw gift frame before emitting
/// [`SourceEvent::Gift`](crate::SourceEvent::Gift). The bundled live-page
/// source is poll-only and never sees gifts, so nothing in this crate calls it.
///
/// Never fails: missing fields degrade to the placeholder name, a count of 1
/// and no gifter.
pub fn normalize_gift_payload(payload: &Value) -> GiftEvent {
	let gift = payload.get("gift").filter(|g| g.is_object()).unwrap_or(payload);

	let name = pick_name(gift).unwrap_or_else(|| GENERIC_GIFT_NAME.to_string());

	let count = pick_count(gift).or_else(|| pick_count(payload)).unwrap_or(1);

	let gifter = payload
		.get("user")
		.filter(|u| u.is_object())
		.and_then(|user| GIFTER_KEYS.iter().find_map(|k| string_field(user, k)));

	GiftEvent::new(name, count, gifter)
}

/// First human-readable name; numeric ids only when nothing better exists.
fn pick_name(gift: &Value) -> Option<String> {
	let candidates: Vec<String> = NAME_KEYS
		.iter()
		.chain(ID_KEYS.iter())
		.filter_map(|k| string_field(gift, k))
		.collect();

	candidates
		.iter()
		.find(|c| !looks_like_id(c))
		.or_else(|| candidates.first())
		.cloned()
}

fn looks_like_id(s: &str) -> bool {
	s.chars().all(|c| c.is_ascii_digit())
}

fn pick_count(v: &Value) -> Option<u64> {
	COUNT_KEYS.iter().find_map(|k| match v.get(*k)? {
		Value::Number(n) => n.as_u64().filter(|n| *n > 0),
		Value::String(s) => s.trim().parse::<u64>().ok().filter(|n| *n > 0),
		_ => None,
	})
}

fn string_field(v: &Value, key: &str) -> Option<String> {
	match v.get(key)? {
		Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}
