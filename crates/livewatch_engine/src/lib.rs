#![forbid(unsafe_code)]

//! Live session reconciliation engine.
//!
//! Merges a push-based signal source and a periodic poll into one
//! per-broadcaster session state machine that emits at most one start and
//! one end notification per session.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod host;
pub mod machine;
pub mod store;

mod probe;
mod reconciler;
mod worker;


#[cfg(test)]
mod machine_tests;

use thiserror::Error;

pub use config::EngineConfig;
pub use engine::Engine;
pub use store::{BroadcasterStatus, SessionPhase, SessionRecord};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
	#[error("engine is already running")]
	AlreadyRunning,

	#[error("engine is not running")]
	NotRunning,
}
