#![forbid(unsafe_code)]

//! Persisted watch-list.
//!
//! Stored as a JSON array of `{ "username": .., "added_at": .. }`. Names are
//! normalized through [`BroadcasterId`], so duplicates and removals are
//! case-insensitive.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context as _, anyhow};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use livewatch_domain::{BroadcasterId, WatchedBroadcaster};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchlistError {
	#[error("user {0} is already in the list")]
	Duplicate(BroadcasterId),

	#[error("save watch-list: {0:#}")]
	Persist(#[from] anyhow::Error),
}

/// On-disk and API shape of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
	pub username: String,
	pub added_at: String,
}

impl From<&WatchedBroadcaster> for WatchEntry {
	fn from(w: &WatchedBroadcaster) -> Self {
		Self {
			username: w.id.to_string(),
			added_at: DateTime::<Utc>::from(w.added_at).to_rfc3339_opts(SecondsFormat::Secs, true),
		}
	}
}

pub struct WatchlistStore {
	path: PathBuf,
	entries: Mutex<Vec<WatchedBroadcaster>>,
}

impl WatchlistStore {
	/// Load from `path`; a missing file is an empty list.
	pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let path = path.into();
		let entries = read_entries(&path).with_context(|| format!("load watch-list from {}", path.display()))?;
		info!(path = %path.display(), users = entries.len(), "watch-list loaded");
		Ok(Self {
			path,
			entries: Mutex::new(entries),
		})
	}

	pub fn entries(&self) -> Vec<WatchedBroadcaster> {
		self.entries.lock().clone()
	}

	pub fn count(&self) -> usize {
		self.entries.lock().len()
	}

	/// Append `id` and persist. The in-memory list is unchanged if the write fails.
	pub fn add(&self, id: BroadcasterId) -> Result<WatchedBroadcaster, WatchlistError> {
		let mut entries = self.entries.lock();
		if entries.iter().any(|w| w.id == id) {
			return Err(WatchlistError::Duplicate(id));
		}

		let added = WatchedBroadcaster::new(id);
		let mut next = entries.clone();
		next.push(added.clone());
		write_entries(&self.path, &next)?;
		*entries = next;

		debug!(broadcaster = %added.id, "watch-list entry added");
		Ok(added)
	}

	/// Remove `id` and persist. Removing an absent name is not an error;
	/// returns whether an entry was dropped.
	pub fn remove(&self, id: &BroadcasterId) -> Result<bool, WatchlistError> {
		let mut entries = self.entries.lock();
		let next: Vec<WatchedBroadcaster> = entries.iter().filter(|w| &w.id != id).cloned().collect();
		let removed = next.len() != entries.len();
		if removed {
			write_entries(&self.path, &next)?;
			*entries = next;
			debug!(broadcaster = %id, "watch-list entry removed");
		}
		Ok(removed)
	}
}

fn read_entries(path: &Path) -> anyhow::Result<Vec<WatchedBroadcaster>> {
	let raw = match fs::read_to_string(path) {
		Ok(s) => s,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(anyhow!(e).context("read watch-list file")),
	};
	if raw.trim().is_empty() {
		return Ok(Vec::new());
	}

	let file: Vec<WatchEntry> = serde_json::from_str(&raw).context("parse watch-list JSON")?;
	let mut out: Vec<WatchedBroadcaster> = Vec::with_capacity(file.len());
	for entry in file {
		let id = match BroadcasterId::new(&entry.username) {
			Ok(id) => id,
			Err(e) => {
				warn!(username = %entry.username, error = %e, "skipping invalid watch-list entry");
				continue;
			}
		};
		if out.iter().any(|w| w.id == id) {
			warn!(broadcaster = %id, "skipping duplicate watch-list entry");
			continue;
		}
		out.push(WatchedBroadcaster {
			id,
			added_at: parse_added_at(&entry.added_at),
		});
	}
	Ok(out)
}

/// RFC 3339, or a naive ISO timestamp taken as UTC. Unparseable values become "now".
fn parse_added_at(s: &str) -> SystemTime {
	if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
		return dt.with_timezone(&Utc).into();
	}
	if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
		return naive.and_utc().into();
	}
	debug!(added_at = s, "unparseable added_at; using current time");
	SystemTime::now()
}

fn write_entries(path: &Path, entries: &[WatchedBroadcaster]) -> anyhow::Result<()> {
	if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
		fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
	}

	let file: Vec<WatchEntry> = entries.iter().map(WatchEntry::from).collect();
	let json = serde_json::to_string_pretty(&file).context("encode watch-list")?;

	let tmp = path.with_extension("json.tmp");
	fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
	fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
	Ok(())
}
