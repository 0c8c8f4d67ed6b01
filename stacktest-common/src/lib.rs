//! Building blocks for black-box end-to-end tests of a clustered stack.
//!
//! - [`track`]: wait for lines to appear in child process output
//! - [`process`]: supervise a child process and its output
//! - [`convergence`]: poll an eventually-consistent backend until checks pass
//! - [`graphite`], [`fakemetrics`], [`grafana`]: query, workload and
//!   annotation collaborators
//! - [`config`], [`logging`], [`stack`]: ambient setup

pub mod config;
pub mod convergence;
pub mod fakemetrics;
pub mod grafana;
pub mod graphite;
pub mod logging;
pub mod process;
pub mod stack;
pub mod track;

pub use config::StackConfig;
pub use convergence::{ConvergencePoller, PollOutcome, Predicate, Verdict};
pub use process::{ExitOutcome, ProcessSupervisor, SupervisorError};
pub use track::{MatchHandle, StreamTracker, TrackError, TrackerOptions};
