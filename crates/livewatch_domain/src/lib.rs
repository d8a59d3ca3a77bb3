#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid character {0:?} in broadcaster id")]
	InvalidChar(char),
}

/// Normalized broadcaster identifier.
///
/// Input is trimmed, a single leading `@` is stripped and the result is
/// lowercased, so `"@Alice "` and `"alice"` name the same broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BroadcasterId(String);

impl BroadcasterId {
	/// Create a normalized, non-empty `BroadcasterId`.
	pub fn new(id: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let id = id.as_ref().trim();
		let id = id.strip_prefix('@').unwrap_or(id).trim();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if let Some(c) = id.chars().find(|c| c.is_whitespace() || c.is_control() || *c == '/') {
			return Err(ParseIdError::InvalidChar(c));
		}
		Ok(Self(id.to_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for BroadcasterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for BroadcasterId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		BroadcasterId::new(s)
	}
}

impl TryFrom<String> for BroadcasterId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		BroadcasterId::new(value)
	}
}

impl From<BroadcasterId> for String {
	fn from(v: BroadcasterId) -> Self {
		v.0
	}
}

/// Watch-list entry supplied by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedBroadcaster {
	pub id: BroadcasterId,
	pub added_at: SystemTime,
}

impl WatchedBroadcaster {
	pub fn new(id: BroadcasterId) -> Self {
		Self {
			id,
			added_at: SystemTime::now(),
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn broadcaster_id_normalizes() {
		assert_eq!(BroadcasterId::new("@Alice ").unwrap().as_str(), "alice");
		assert_eq!("BOB".parse::<BroadcasterId>().unwrap().to_string(), "bob");
		assert_eq!(BroadcasterId::new("@carol").unwrap(), BroadcasterId::new("Carol").unwrap());
	}

	#[test]
	fn rejects_empty_and_malformed_ids() {
		assert_eq!(BroadcasterId::new("").unwrap_err(), ParseIdError::Empty);
		assert_eq!(BroadcasterId::new("  @ ").unwrap_err(), ParseIdError::Empty);
		assert_eq!(BroadcasterId::new("a b").unwrap_err(), ParseIdError::InvalidChar(' '));
		assert!(BroadcasterId::new("a/b").is_err());
	}

	#[test]
	fn try_from_string_goes_through_normalization() {
		let id = BroadcasterId::try_from("@Dave".to_string()).unwrap();
		assert_eq!(id.as_str(), "dave");
		assert_eq!(String::from(id), "dave");
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("https://discord.com/api/webhooks/1/abc");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert!(!s.is_blank());
		assert!(SecretString::new("  ").is_blank());
	}
}
