//! Logging setup for the harness and its tests.
//!
//! ```ignore
//! use stacktest_common::logging::init_logging;
//!
//! init_logging("info", Some(Path::new("target/stacktest/run.jsonl")));
//! tracing::info!("stack now running");
//! ```

use std::path::Path;
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static LOGGING_INIT: Once = Once::new();

/// Install the global subscriber.
///
/// `level` applies to the harness crates unless `RUST_LOG` is set. When
/// `json_file` is given, every event is also written there as JSONL.
/// Safe to call multiple times; only the first call has an effect.
pub fn init_logging(level: &str, json_file: Option<&Path>) {
    LOGGING_INIT.call_once(|| {
        let file_layer = json_file.and_then(open_log_file).map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_current_span(true)
                .with_thread_names(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(filter_for(level))
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Initialize logging for tests, captured by the test harness.
///
/// Level comes from `STACKTEST_TEST_LOG_LEVEL` (default: `debug`).
pub fn init_test_logging() {
    let level = std::env::var("STACKTEST_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter_for(&level))
        .try_init();
}

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "stacktest={level},stacktest_common={level},warn"
            ))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::File::create(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("stacktest: cannot open log file {}: {e}", path.display());
            None
        }
    }
}
