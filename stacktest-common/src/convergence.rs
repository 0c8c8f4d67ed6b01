//! Retrying convergence checks against eventually-consistent backends.
//!
//! A [`ConvergencePoller`] runs a query up to a fixed number of times and
//! applies an ordered list of named predicates to every response. All
//! predicates are evaluated on every attempt so each verdict can be logged,
//! and the attempt passes only when all of them hold.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

type Check<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// A named boolean check over a single response.
pub struct Predicate<R> {
    name: String,
    check: Check<R>,
}

impl<R> Predicate<R> {
    pub fn new(name: impl Into<String>, check: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, response: &R) -> bool {
        (self.check)(response)
    }
}

impl<R> fmt::Debug for Predicate<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("name", &self.name).finish()
    }
}

/// The verdict of one predicate on one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub predicate: String,
    pub passed: bool,
}

/// Result of a polling run.
#[derive(Debug, Clone)]
pub struct PollOutcome<R> {
    /// True iff some attempt satisfied every predicate.
    pub success: bool,
    /// Number of queries issued.
    pub attempts: u32,
    /// Most recent response the query produced, if any attempt succeeded
    /// in producing one.
    pub last_response: Option<R>,
    /// Verdicts for `last_response`.
    pub verdicts: Vec<Verdict>,
    /// Error of the final attempt when its query failed.
    pub last_error: Option<String>,
    pub elapsed: Duration,
}

/// Polls a query until a conjunction of predicates holds.
#[derive(Debug)]
pub struct ConvergencePoller<R> {
    description: String,
    predicates: Vec<Predicate<R>>,
    max_attempts: u32,
    interval: Duration,
}

impl<R> ConvergencePoller<R> {
    pub fn new(description: impl Into<String>, max_attempts: u32, interval: Duration) -> Self {
        Self {
            description: description.into(),
            predicates: Vec::new(),
            max_attempts,
            interval,
        }
    }

    /// Append a predicate.
    pub fn predicate(
        mut self,
        name: impl Into<String>,
        check: impl Fn(&R) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.push(Predicate::new(name, check));
        self
    }

    /// Append an already constructed predicate.
    pub fn push(&mut self, predicate: Predicate<R>) {
        self.predicates.push(predicate);
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Evaluate every predicate against `response`, without short-circuit.
    pub fn evaluate(&self, response: &R) -> Vec<Verdict> {
        self.predicates
            .iter()
            .map(|p| Verdict {
                predicate: p.name.clone(),
                passed: p.check(response),
            })
            .collect()
    }

    /// Run the retry loop.
    ///
    /// Query errors are logged and count as failed attempts. The interval
    /// is slept between attempts but not after the last one.
    pub fn run<F, E>(&self, mut query: F) -> PollOutcome<R>
    where
        F: FnMut() -> Result<R, E>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let mut last_response = None;
        let mut verdicts = Vec::new();
        let mut last_error = None;

        debug!(
            "Polling for: {} (attempts: {}, interval: {:?})",
            self.description, self.max_attempts, self.interval
        );

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                std::thread::sleep(self.interval);
            }

            match query() {
                Ok(response) => {
                    last_error = None;
                    verdicts = self.evaluate(&response);
                    let passed = verdicts.iter().all(|v| v.passed);
                    info!(
                        "{} attempt {attempt}/{}: {}",
                        self.description,
                        self.max_attempts,
                        format_verdicts(&verdicts)
                    );
                    last_response = Some(response);
                    if passed {
                        info!(
                            "Converged: {} after {attempt} attempts ({:?})",
                            self.description,
                            start.elapsed()
                        );
                        return PollOutcome {
                            success: true,
                            attempts: attempt,
                            last_response,
                            verdicts,
                            last_error,
                            elapsed: start.elapsed(),
                        };
                    }
                }
                Err(e) => {
                    warn!(
                        "{} attempt {attempt}/{}: query failed: {e}",
                        self.description, self.max_attempts
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        warn!(
            "Did not converge: {} after {} attempts ({:?})",
            self.description,
            self.max_attempts,
            start.elapsed()
        );
        PollOutcome {
            success: false,
            attempts: self.max_attempts,
            last_response,
            verdicts,
            last_error,
            elapsed: start.elapsed(),
        }
    }
}

fn format_verdicts(verdicts: &[Verdict]) -> String {
    if verdicts.is_empty() {
        return "no conditions".to_string();
    }
    verdicts
        .iter()
        .map(|v| format!("condition {} {}", v.predicate, v.passed))
        .collect::<Vec<_>>()
        .join(" - ")
}
