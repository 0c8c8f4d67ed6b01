//! Scenario lifecycle: pre-clean, launch, cases, teardown.

use std::time::{Duration, Instant};

use stacktest_common::process::SupervisorResult;
use stacktest_common::stack::StackLayout;
use stacktest_common::{ExitOutcome, ProcessSupervisor, StackConfig};
use tracing::{error, info, warn};

use crate::cases::{Case, CaseFailure};
use crate::context::{StackContext, tracker_options};

/// Every selected case passed and the stack shut down cleanly.
pub const EXIT_OK: u8 = 0;
/// A case failed, or the stack could not be launched.
pub const EXIT_CASE_FAILED: u8 = 1;
/// Pre-clean or teardown of the stack failed.
pub const EXIT_TEARDOWN_FAILED: u8 = 2;

/// Output lines replayed after a failure.
const FAILURE_TAIL: usize = 40;

#[derive(Debug)]
pub struct CaseReport {
    pub name: &'static str,
    pub result: Result<(), CaseFailure>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RunReport {
    pub cases: Vec<CaseReport>,
    /// How the stack ended, or why it could not be stopped.
    pub teardown: Result<ExitOutcome, String>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.cases.iter().filter(|c| c.result.is_err()).count()
    }

    pub fn teardown_ok(&self) -> bool {
        matches!(&self.teardown, Ok(outcome) if outcome.is_success())
    }

    pub fn exit_code(&self) -> u8 {
        if !self.teardown_ok() {
            EXIT_TEARDOWN_FAILED
        } else if self.failed() > 0 {
            EXIT_CASE_FAILED
        } else {
            EXIT_OK
        }
    }

    pub fn summary(&self) -> String {
        let teardown = match &self.teardown {
            Ok(outcome) => outcome.to_string(),
            Err(e) => e.clone(),
        };
        format!(
            "{} passed, {} failed; stack {}",
            self.cases.len() - self.failed(),
            self.failed(),
            teardown
        )
    }
}

/// Bring down leftovers of a previous run.
pub fn pre_clean(config: &StackConfig) -> SupervisorResult<ExitOutcome> {
    let layout = StackLayout::new(config.stack_root.clone());
    let mut down = ProcessSupervisor::new(
        "compose-down",
        layout.compose_down(&config.environment),
        tracker_options(config),
    );
    info!(dir = %layout.compose_dir(&config.environment).display(), "stopping previous stack");
    down.run_to_completion()
}

/// Exit code for a finished pre-clean, or `None` when the run may go on.
pub fn pre_clean_exit(result: SupervisorResult<ExitOutcome>) -> Option<u8> {
    match result {
        Ok(outcome) if outcome.is_success() => None,
        Ok(outcome) => {
            error!("docker-compose down failed: {outcome}");
            Some(EXIT_TEARDOWN_FAILED)
        }
        Err(e) => {
            error!("docker-compose down failed: {e}");
            Some(EXIT_TEARDOWN_FAILED)
        }
    }
}

/// Launch the stack, run `cases` in order and tear the stack down.
///
/// A launch failure is returned as an error; everything after launch is
/// captured in the report.
pub fn execute(ctx: &mut StackContext, cases: &[&Case]) -> SupervisorResult<RunReport> {
    ctx.launch()?;

    let mut reports = Vec::with_capacity(cases.len());
    for case in cases {
        let started = Instant::now();
        let result = case.run(ctx);
        let elapsed = started.elapsed();
        match &result {
            Ok(()) => info!("PASS {} ({:.1?})", case.name, elapsed),
            Err(e) => error!("FAIL {} ({:.1?}): {}", case.name, elapsed, e.message),
        }
        reports.push(CaseReport {
            name: case.name,
            result,
            elapsed,
        });
    }

    let teardown = teardown(ctx);
    let report = RunReport {
        cases: reports,
        teardown,
    };
    if report.exit_code() != EXIT_OK {
        dump_output(ctx);
    }
    Ok(report)
}

/// Stop the workload, interrupt the stack and wait for it to exit.
fn teardown(ctx: &mut StackContext) -> Result<ExitOutcome, String> {
    ctx.workload.close();

    info!("stopping stack");
    if let Err(e) = ctx.stack.signal_stop() {
        // Still collect the exit status; the process may already be gone.
        warn!("could not interrupt stack: {e}");
    }
    match ctx.stack.wait() {
        Ok(outcome) if outcome.is_success() => Ok(outcome),
        Ok(outcome) => {
            error!("stack did not shut down cleanly: {outcome}");
            Err(format!("did not shut down cleanly: {outcome}"))
        }
        Err(e) => {
            error!("failed to collect stack exit status: {e}");
            Err(e.to_string())
        }
    }
}

fn dump_output(ctx: &StackContext) {
    let tail = ctx.tracker().tail(FAILURE_TAIL);
    if tail.is_empty() {
        return;
    }
    warn!("last {} lines of stack output:", tail.len());
    for line in tail {
        warn!(target: "stacktest::output", "[{}] {}", line.stream, line.line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::{Arc, Mutex, PoisonError};

    use stacktest_common::fakemetrics::{Workload, WorkloadError};
    use stacktest_common::grafana::RecordingAnnotator;
    use stacktest_common::graphite::{Point, QueryError, RenderApi, Response, Series};
    use stacktest_common::{ProcessSupervisor, SupervisorError, TrackerOptions};

    use crate::cases::{self, INGEST_QUERY, INGEST_TARGET};

    const READY_SCRIPT: &str = concat!(
        "trap 'echo stopping; exit 130' INT; ",
        "echo 'metrictank_1 | [I] metricIndex initialized in 2ms. starting data consumption'; ",
        "echo 'metrictank_1 | [I] carbon-in: listening on :2003'; ",
        "echo 'grafana_1 | msg=\"Initializing HTTP Server\" address=0.0.0.0:3000' >&2; ",
        "while true; do sleep 0.05; done"
    );

    #[derive(Clone, Default)]
    struct FakeWorkload {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl FakeWorkload {
        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl Workload for FakeWorkload {
        fn start(&mut self, rate: u32) -> Result<(), WorkloadError> {
            self.events.lock().unwrap().push(format!("start {rate}"));
            Ok(())
        }

        fn close(&mut self) {
            self.events.lock().unwrap().push("close".to_string());
        }
    }

    /// Answers every render with the same series.
    struct FakeGraphite {
        values: Vec<Option<f64>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    impl RenderApi for FakeGraphite {
        fn render(&self, target: &str, from: &str) -> Result<Response, QueryError> {
            self.queries
                .lock()
                .unwrap()
                .push(format!("{target} from {from}"));
            Ok(Response {
                status: 200,
                series: vec![Series {
                    target: INGEST_TARGET.to_string(),
                    datapoints: self
                        .values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| Point(*v, 1_700_000_000 + i as i64))
                        .collect(),
                }],
            })
        }
    }

    struct Harness {
        ctx: StackContext,
        annotations: RecordingAnnotator,
        workload: FakeWorkload,
        queries: Arc<Mutex<Vec<String>>>,
    }

    fn harness(script: &str, values: Vec<Option<f64>>) -> Harness {
        let config = StackConfig {
            startup_timeout: Duration::from_secs(10),
            poll_attempts: 3,
            poll_interval: Duration::ZERO,
            ..StackConfig::default()
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        let stack = ProcessSupervisor::new("launch", cmd, TrackerOptions::default());

        let annotations = RecordingAnnotator::default();
        let workload = FakeWorkload::default();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let graphite = FakeGraphite {
            values,
            queries: Arc::clone(&queries),
        };
        let ctx = StackContext::new(
            config,
            stack,
            Box::new(annotations.clone()),
            Box::new(graphite),
            Box::new(workload.clone()),
        );
        Harness {
            ctx,
            annotations,
            workload,
            queries,
        }
    }

    fn steady() -> Vec<Option<f64>> {
        let mut values = vec![None];
        values.extend([Some(1000.0); 7]);
        values
    }

    #[test]
    fn test_full_run_passes() {
        let mut h = harness(READY_SCRIPT, steady());
        let selected = cases::select(&[]).unwrap();
        let report = execute(&mut h.ctx, &selected).unwrap();

        assert_eq!(report.exit_code(), EXIT_OK, "{}", report.summary());
        assert_eq!(report.cases.len(), 2);
        assert_eq!(h.annotations.labels(), vec!["TestBaseIngestWorkload:begin"]);
        assert_eq!(h.workload.events(), vec!["start 1000", "close"]);
        assert_eq!(
            h.queries.lock().unwrap().as_slice(),
            [format!("{INGEST_QUERY} from -8s")]
        );
        assert!(matches!(report.teardown, Ok(ExitOutcome::Interrupted)));
    }

    #[test]
    fn test_ingest_that_never_converges_fails_case() {
        let mut h = harness(READY_SCRIPT, vec![Some(10.0); 8]);
        let selected = cases::select(&[]).unwrap();
        let report = execute(&mut h.ctx, &selected).unwrap();

        assert_eq!(report.exit_code(), EXIT_CASE_FAILED);
        assert!(report.cases[0].result.is_ok());
        let failure = report.cases[1].result.as_ref().unwrap_err();
        assert!(failure.message.contains("last response was"));
        assert!(failure.message.contains("after 3 attempts"));
        assert_eq!(
            h.annotations.labels(),
            vec!["TestBaseIngestWorkload:begin", "TestBaseIngestWorkload:FAIL"]
        );
        assert_eq!(h.queries.lock().unwrap().len(), 3);
        assert!(report.teardown_ok());
    }

    #[test]
    fn test_startup_timeout_posts_failure() {
        let mut h = harness(
            "trap 'exit 130' INT; echo 'nothing useful'; while true; do sleep 0.05; done",
            steady(),
        );
        h.ctx.config.startup_timeout = Duration::from_millis(200);
        let selected = cases::select(&["startup".to_string()]).unwrap();
        let report = execute(&mut h.ctx, &selected).unwrap();

        assert_eq!(report.exit_code(), EXIT_CASE_FAILED);
        let failure = report.cases[0].result.as_ref().unwrap_err();
        assert!(failure.message.contains("timed out"));
        assert_eq!(h.annotations.labels(), vec!["TestStartup:FAIL"]);
        // The workload was never started but is still closed on teardown.
        assert_eq!(h.workload.events(), vec!["close"]);
    }

    #[test]
    fn test_unclean_shutdown_is_teardown_failure() {
        let script = READY_SCRIPT.replace("exit 130", "exit 1");
        let mut h = harness(&script, steady());
        let selected = cases::select(&["startup".to_string()]).unwrap();
        let report = execute(&mut h.ctx, &selected).unwrap();

        assert!(report.cases[0].result.is_ok());
        assert!(!report.teardown_ok());
        assert_eq!(report.exit_code(), EXIT_TEARDOWN_FAILED);
    }

    #[test]
    fn test_launch_failure_is_error() {
        let config = StackConfig::default();
        let stack = ProcessSupervisor::new(
            "launch",
            Command::new("/nonexistent/launch.sh"),
            TrackerOptions::default(),
        );
        let mut ctx = StackContext::new(
            config,
            stack,
            Box::new(RecordingAnnotator::default()),
            Box::new(FakeGraphite {
                values: steady(),
                queries: Arc::default(),
            }),
            Box::new(FakeWorkload::default()),
        );
        assert!(execute(&mut ctx, &cases::select(&[]).unwrap()).is_err());
    }

    #[test]
    fn test_pre_clean_of_missing_stack_dir_exits_2() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig {
            stack_root: dir.path().to_path_buf(),
            ..StackConfig::default()
        };
        // Either docker-compose is absent or the compose dir is: never clean.
        assert_eq!(pre_clean_exit(pre_clean(&config)), Some(EXIT_TEARDOWN_FAILED));
    }

    #[test]
    fn test_pre_clean_exit_codes() {
        assert_eq!(pre_clean_exit(Ok(ExitOutcome::Clean)), None);
        assert_eq!(
            pre_clean_exit(Ok(ExitOutcome::Failed { code: 1 })),
            Some(EXIT_TEARDOWN_FAILED)
        );
        assert_eq!(
            pre_clean_exit(Err(SupervisorError::StartupFailed(
                "docker-compose: not found".to_string()
            ))),
            Some(EXIT_TEARDOWN_FAILED)
        );
    }
}
