//! Convergence poller E2E tests.
//!
//! Uses query stubs with scripted responses to check attempt accounting,
//! spacing between attempts and predicate evaluation.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use stacktest_common::ConvergencePoller;
use stacktest_common::graphite::{
    Point, Response, Series, ge, validate_avg_windowed, validate_len_nulls, validate_targets,
};

const INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    NotYet(u32),
    Ready,
}

#[test]
fn test_success_after_k_misses() {
    let max_attempts = 6;
    let k = 3;
    let calls = RefCell::new(0u32);
    let poller = ConvergencePoller::new("ready after misses", max_attempts, INTERVAL)
        .predicate("is ready", |p: &Readiness| *p == Readiness::Ready);

    let outcome = poller.run(|| {
        let mut calls = calls.borrow_mut();
        *calls += 1;
        if *calls <= k {
            Ok::<_, String>(Readiness::NotYet(*calls))
        } else {
            Ok(Readiness::Ready)
        }
    });

    assert!(outcome.success);
    assert_eq!(outcome.attempts, k + 1);
    assert!(outcome.attempts <= max_attempts);
    assert_eq!(outcome.last_response, Some(Readiness::Ready));
    assert_eq!(*calls.borrow(), k + 1);
}

#[test]
fn test_failure_after_exactly_max_attempts() {
    let max_attempts = 4;
    let calls = RefCell::new(Vec::<Instant>::new());
    let poller = ConvergencePoller::new("never ready", max_attempts, INTERVAL)
        .predicate("is ready", |p: &Readiness| *p == Readiness::Ready);

    let outcome = poller.run(|| {
        let mut calls = calls.borrow_mut();
        calls.push(Instant::now());
        Ok::<_, String>(Readiness::NotYet(calls.len() as u32))
    });

    let calls = calls.into_inner();
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, max_attempts);
    assert_eq!(calls.len(), max_attempts as usize);
    for pair in calls.windows(2) {
        assert!(
            pair[1].duration_since(pair[0]) >= INTERVAL,
            "attempts closer than the interval"
        );
    }
    assert_eq!(outcome.last_response, Some(Readiness::NotYet(max_attempts)));
}

#[test]
fn test_predicates_are_not_short_circuited() {
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));
    let (f, s) = (Arc::clone(&first), Arc::clone(&second));

    let poller = ConvergencePoller::new("false then true", 3, Duration::ZERO)
        .predicate("always false", move |_: &u32| {
            f.fetch_add(1, Ordering::SeqCst);
            false
        })
        .predicate("always true", move |_: &u32| {
            s.fetch_add(1, Ordering::SeqCst);
            true
        });

    let outcome = poller.run(|| Ok::<_, String>(1));
    assert!(!outcome.success);
    assert_eq!(first.load(Ordering::SeqCst), 3);
    assert_eq!(second.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.verdicts.len(), 2);
    assert!(!outcome.verdicts[0].passed);
    assert!(outcome.verdicts[1].passed);
}

#[test]
fn test_query_errors_count_as_attempts() {
    let calls = RefCell::new(0u32);
    let poller =
        ConvergencePoller::new("recovers", 5, INTERVAL).predicate("positive", |v: &i32| *v > 0);

    let outcome = poller.run(|| {
        let mut calls = calls.borrow_mut();
        *calls += 1;
        match *calls {
            1 | 2 => Err("connection refused".to_string()),
            _ => Ok(1),
        }
    });

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.last_response, Some(1));
    assert!(outcome.last_error.is_none());
}

#[test]
fn test_predicates_can_be_appended() {
    let mut poller =
        ConvergencePoller::new("growing", 1, Duration::ZERO).predicate("a", |v: &u32| *v > 1);
    poller.push(stacktest_common::Predicate::new("b", |v: &u32| *v < 10));
    poller.push(stacktest_common::Predicate::new("c", |v: &u32| *v % 2 == 0));

    assert!(poller.run(|| Ok::<_, String>(4)).success);
    assert!(!poller.run(|| Ok::<_, String>(5)).success);
}

fn ingest_response(target: &str, values: &[Option<f64>]) -> Response {
    Response {
        status: 200,
        series: vec![Series {
            target: target.to_string(),
            datapoints: values
                .iter()
                .enumerate()
                .map(|(i, v)| Point(*v, 1_700_000_000 + i as i64))
                .collect(),
        }],
    }
}

#[test]
fn test_ingest_validators_converge() {
    let target = "perSecond(metrictank.stats.docker-env.default.input.carbon.metrics_received.counter32)";
    // Two leading nulls: the stack has not been up long enough.
    let warming = ingest_response(
        target,
        &[None, None, Some(200.0), Some(500.0), Some(800.0), Some(900.0), Some(1000.0), Some(1000.0)],
    );
    let steady = ingest_response(
        target,
        &[None, Some(1000.0), Some(1000.0), Some(1001.0), Some(999.0), Some(1000.0), Some(1002.0), Some(1000.0)],
    );

    // Popped from the back: warming first, then steady.
    let responses = RefCell::new(vec![steady.clone(), warming]);
    let poller = ConvergencePoller::new("ingest", 4, Duration::ZERO)
        .predicate("target names", validate_targets([target]))
        .predicate("len & nulls", validate_len_nulls(1, 8))
        .predicate("avg value", validate_avg_windowed(8, ge(1000.0)));

    let outcome = poller.run(|| {
        responses
            .borrow_mut()
            .pop()
            .ok_or_else(|| "no more responses".to_string())
    });

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.last_response, Some(steady));
}
