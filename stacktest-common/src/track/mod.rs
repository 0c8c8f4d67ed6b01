//! Output stream tracking.
//!
//! Consumes line-oriented output of supervised processes on background
//! threads and resolves "wait until these lines appear" requests.

mod matcher;
mod tracker;

use std::time::Duration;

pub use matcher::PatternMatcher;
pub use tracker::{MatchHandle, StreamTracker, TrackedLine, TrackerOptions};

/// Errors raised by the stream tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for patterns: {}", pending.join(", "))]
    Timeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("Tracker closed before the patterns matched")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
