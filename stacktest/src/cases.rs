//! The carbon ingest scenario.

use std::time::Duration;

use stacktest_common::ConvergencePoller;
use stacktest_common::graphite::{
    Response, ge, validate_avg_windowed, validate_len_nulls, validate_targets,
};
use tracing::info;

use crate::context::StackContext;

/// Lines the stack prints once every service accepts traffic.
pub const READY_PATTERNS: [&str; 3] = [
    "metrictank.*metricIndex initialized.*starting data consumption$",
    "metrictank.*carbon-in: listening on.*2003",
    "grafana.*Initializing HTTP Server.*:3000",
];

/// Ingest rate as reported by the instance's own stats.
pub const INGEST_QUERY: &str =
    "perSecond(metrictank.stats.docker-env.*.input.carbon.metrics_received.counter32)";

/// The single series `INGEST_QUERY` must resolve to.
pub const INGEST_TARGET: &str =
    "perSecond(metrictank.stats.docker-env.default.input.carbon.metrics_received.counter32)";

const INGEST_FROM: &str = "-8s";
const INGEST_POINTS: usize = 8;
const INGEST_LEADING_NULLS: usize = 1;

/// A failed case and why.
#[derive(Debug, thiserror::Error)]
#[error("{case}: {message}")]
pub struct CaseFailure {
    pub case: &'static str,
    pub message: String,
}

pub type CaseResult = Result<(), CaseFailure>;

pub struct Case {
    pub name: &'static str,
    pub about: &'static str,
    run: fn(&mut StackContext) -> CaseResult,
}

impl Case {
    pub fn run(&self, ctx: &mut StackContext) -> CaseResult {
        info!(case = self.name, "case started");
        (self.run)(ctx)
    }
}

/// All cases, in execution order.
pub static CASES: [Case; 2] = [
    Case {
        name: "startup",
        about: "wait for metrictank and grafana to report readiness",
        run: startup,
    },
    Case {
        name: "base_ingest_workload",
        about: "feed carbon traffic and wait for the ingest rate to show up",
        run: base_ingest_workload,
    },
];

/// Resolve `names` to cases, keeping execution order. Empty means all.
pub fn select(names: &[String]) -> Result<Vec<&'static Case>, String> {
    if let Some(unknown) = names
        .iter()
        .find(|name| !CASES.iter().any(|case| case.name == name.as_str()))
    {
        return Err(format!(
            "unknown case '{unknown}' (available: {})",
            CASES.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
        ));
    }
    Ok(CASES
        .iter()
        .filter(|case| names.is_empty() || names.iter().any(|n| n == case.name))
        .collect())
}

fn failure(case: &'static str, message: impl Into<String>) -> CaseFailure {
    CaseFailure {
        case,
        message: message.into(),
    }
}

fn startup(ctx: &mut StackContext) -> CaseResult {
    let handle = match ctx.readiness.take() {
        Some(handle) => handle,
        None => ctx
            .tracker()
            .match_patterns(READY_PATTERNS)
            .map_err(|e| failure("startup", e.to_string()))?,
    };

    match handle.wait(ctx.config.startup_timeout) {
        Ok(()) => {
            info!("stack now running");
            info!("Go to {} to see what's going on", ctx.config.grafana_url);
            Ok(())
        }
        Err(e) => {
            ctx.annotate("TestStartup:FAIL");
            Err(failure(
                "startup",
                format!("timed out while waiting for all metrictank instances to come up: {e}"),
            ))
        }
    }
}

/// Checks a render response must pass for `rate` points per second.
pub fn ingest_poller(rate: u32, attempts: u32, interval: Duration) -> ConvergencePoller<Response> {
    ConvergencePoller::new(format!("ingest of {rate} points per second"), attempts, interval)
        .predicate("target names", validate_targets([INGEST_TARGET]))
        .predicate(
            "data length and nulls",
            validate_len_nulls(INGEST_LEADING_NULLS, INGEST_POINTS),
        )
        .predicate(
            "average ingest rate",
            validate_avg_windowed(INGEST_POINTS, ge(f64::from(rate))),
        )
}

fn base_ingest_workload(ctx: &mut StackContext) -> CaseResult {
    const CASE: &str = "base_ingest_workload";

    ctx.annotate("TestBaseIngestWorkload:begin");
    let rate = ctx.config.metrics_per_second;

    if let Err(e) = ctx.workload.start(rate) {
        ctx.annotate("TestBaseIngestWorkload:FAIL");
        return Err(failure(CASE, format!("could not start workload: {e}")));
    }

    let poller = ingest_poller(rate, ctx.config.poll_attempts, ctx.config.poll_interval);
    let graphite = &ctx.graphite;
    let outcome = poller.run(|| graphite.render(INGEST_QUERY, INGEST_FROM));
    if outcome.success {
        return Ok(());
    }

    ctx.annotate("TestBaseIngestWorkload:FAIL");
    let last = match (&outcome.last_response, &outcome.last_error) {
        (Some(response), _) => response.dump(),
        (None, Some(err)) => format!("no response, last error: {err}"),
        (None, None) => "no response".to_string(),
    };
    Err(failure(
        CASE,
        format!(
            "cluster did not reach a state where the instance receives {rate} points per second after {} attempts. last response was: {last}",
            outcome.attempts
        ),
    ))
}
