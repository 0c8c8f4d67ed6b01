//! The stream tracker.
//!
//! Every attached stream gets its own reader thread. Readers share one
//! mutex-guarded registry holding the outstanding match requests and the
//! line history, so line evaluation is serialized across streams while
//! the order within a single stream is preserved.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, LineWriter, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::TrackError;
use super::matcher::{MatchRequest, PatternMatcher};

/// Default number of lines retained for diagnostics.
const DEFAULT_MAX_HISTORY: usize = 100_000;

/// Options controlling how tracked output is echoed and retained.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Echo every line through the tracing log.
    pub echo: bool,
    /// When set, each stream is also written to `<log_dir>/<label>.log`.
    pub log_dir: Option<PathBuf>,
    /// Maximum number of lines kept in the history (oldest dropped first).
    pub max_history: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            echo: false,
            log_dir: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// A line observed on one of the tracked streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedLine {
    pub stream: String,
    pub line: String,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    requests: Vec<MatchRequest>,
    history: VecDeque<TrackedLine>,
    max_history: usize,
}

impl Registry {
    fn observe(&mut self, stream: &str, line: String) {
        let mut completed = Vec::new();
        for request in self.requests.iter_mut() {
            if request.observe(&line) {
                completed.push(request.id);
            }
        }
        if !completed.is_empty() {
            self.requests.retain(|r| !completed.contains(&r.id));
            debug!(stream, requests = ?completed, "match requests satisfied");
        }

        if self.max_history > 0 {
            if self.history.len() == self.max_history {
                self.history.pop_front();
            }
            self.history.push_back(TrackedLine {
                stream: stream.to_string(),
                line,
            });
        }
    }

    fn withdraw(&mut self, id: u64) -> Option<MatchRequest> {
        let index = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(index))
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumes process output and resolves pattern match requests.
#[derive(Debug)]
pub struct StreamTracker {
    registry: Arc<Mutex<Registry>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    options: TrackerOptions,
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new(TrackerOptions::default())
    }
}

impl StreamTracker {
    pub fn new(options: TrackerOptions) -> Self {
        let registry = Registry {
            max_history: options.max_history,
            ..Registry::default()
        };
        Self {
            registry: Arc::new(Mutex::new(registry)),
            readers: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Start reading `reader` on a dedicated thread until end-of-input.
    ///
    /// Returns as soon as the reader is running. Fails only when the
    /// stream's log file cannot be created.
    pub fn attach<R>(&self, label: impl Into<String>, reader: R) -> Result<(), TrackError>
    where
        R: Read + Send + 'static,
    {
        let label = label.into();
        let sink = match &self.options.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(format!("{label}.log"));
                debug!(stream = %label, path = %path.display(), "writing stream log");
                Some(LineWriter::new(File::create(path)?))
            }
            None => None,
        };

        let registry = Arc::clone(&self.registry);
        let echo = self.options.echo;
        let thread_label = label.clone();
        let handle = thread::Builder::new()
            .name(format!("track-{label}"))
            .spawn(move || read_stream(&thread_label, reader, &registry, echo, sink))?;

        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        debug!(stream = %label, "stream attached");
        Ok(())
    }

    /// Register a request that completes once every pattern has matched a
    /// line read after this call.
    ///
    /// An empty pattern set completes immediately.
    pub fn match_patterns<I, S>(&self, patterns: I) -> Result<MatchHandle, TrackError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = patterns
            .into_iter()
            .map(|p| PatternMatcher::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let patterns: Vec<String> = matchers.iter().map(|m| m.pattern().to_string()).collect();

        let (tx, rx) = sync_channel(1);
        if matchers.is_empty() {
            let _ = tx.try_send(());
            return Ok(MatchHandle {
                id: 0,
                receiver: rx,
                registry: Weak::new(),
                patterns,
                settled: false,
                completed: false,
            });
        }

        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.requests.push(MatchRequest::new(id, matchers, tx));
        debug!(request = id, patterns = ?patterns, "match request registered");

        Ok(MatchHandle {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
            patterns,
            settled: false,
            completed: false,
        })
    }

    /// Block until every attached stream has reached end-of-input.
    pub fn wait_close(&self) {
        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for reader in readers {
            let name = reader.thread().name().unwrap_or("track").to_string();
            if reader.join().is_err() {
                error!(thread = %name, "stream reader panicked");
            }
        }
    }

    /// Number of requests still waiting for lines.
    pub fn outstanding(&self) -> usize {
        lock(&self.registry).requests.len()
    }

    /// Every retained line, in arrival order.
    pub fn history(&self) -> Vec<TrackedLine> {
        lock(&self.registry).history.iter().cloned().collect()
    }

    /// The last `n` retained lines.
    pub fn tail(&self, n: usize) -> Vec<TrackedLine> {
        let registry = lock(&self.registry);
        let skip = registry.history.len().saturating_sub(n);
        registry.history.iter().skip(skip).cloned().collect()
    }
}

fn read_stream<R: Read>(
    label: &str,
    reader: R,
    registry: &Mutex<Registry>,
    echo: bool,
    mut sink: Option<LineWriter<File>>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0u64;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                lines += 1;
                if echo {
                    info!(target: "stacktest::output", stream = label, "{line}");
                }
                let write_failed = match sink.as_mut() {
                    Some(writer) => writeln!(writer, "{line}").err(),
                    None => None,
                };
                if let Some(e) = write_failed {
                    warn!(stream = label, "disabling stream log after write error: {e}");
                    sink = None;
                }
                lock(registry).observe(label, line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(stream = label, "stream read failed: {e}");
                break;
            }
        }
    }
    if let Some(mut writer) = sink {
        let _ = writer.flush();
    }
    debug!(stream = label, lines, "stream reached end of input");
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Handle to a registered match request.
///
/// Waiting consumes the handle. A handle that is dropped before its
/// request completed withdraws the request from the tracker.
#[derive(Debug)]
pub struct MatchHandle {
    id: u64,
    receiver: Receiver<()>,
    registry: Weak<Mutex<Registry>>,
    patterns: Vec<String>,
    settled: bool,
    completed: bool,
}

impl MatchHandle {
    /// The patterns this request waits for.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check for completion without blocking.
    pub fn is_complete(&mut self) -> bool {
        if !self.completed && self.receiver.try_recv().is_ok() {
            self.completed = true;
        }
        self.completed
    }

    /// Wait until every pattern matched or `timeout` elapsed.
    ///
    /// On timeout the request is withdrawn and the error lists the
    /// patterns that never matched.
    pub fn wait(mut self, timeout: Duration) -> Result<(), TrackError> {
        self.settled = true;
        if self.completed {
            return Ok(());
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                let pending = self.withdraw();
                // The request may have completed between the deadline and
                // the withdrawal.
                if self.receiver.try_recv().is_ok() {
                    return Ok(());
                }
                Err(TrackError::Timeout {
                    timeout,
                    pending: pending.unwrap_or_else(|| self.patterns.clone()),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TrackError::Closed),
        }
    }

    /// Withdraw the request without waiting.
    pub fn cancel(mut self) {
        self.settled = true;
        self.withdraw();
    }

    fn withdraw(&self) -> Option<Vec<String>> {
        let registry = self.registry.upgrade()?;
        let request = lock(&registry).withdraw(self.id)?;
        debug!(request = self.id, "match request withdrawn");
        Some(request.pending())
    }
}

impl Drop for MatchHandle {
    fn drop(&mut self) {
        if !self.settled {
            self.withdraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn test_history_records_unmatched_lines() {
        let tracker = StreamTracker::default();
        tracker
            .attach("out", Cursor::new(b"one\ntwo\nthree\n".to_vec()))
            .unwrap();
        tracker.wait_close();

        let lines: Vec<_> = tracker.history().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(tracker.tail(2).len(), 2);
        assert_eq!(tracker.tail(2)[0].line, "two");
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = StreamTracker::new(TrackerOptions {
            max_history: 2,
            ..TrackerOptions::default()
        });
        tracker
            .attach("out", Cursor::new(b"a\nb\nc\n".to_vec()))
            .unwrap();
        tracker.wait_close();

        let lines: Vec<_> = tracker.history().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn test_empty_pattern_set_completes_immediately() {
        let tracker = StreamTracker::default();
        let handle = tracker.match_patterns(Vec::<String>::new()).unwrap();
        assert!(handle.wait(Duration::from_millis(10)).is_ok());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_invalid_pattern_registers_nothing() {
        let tracker = StreamTracker::default();
        let err = tracker.match_patterns(["ok", "[broken"]).unwrap_err();
        assert!(matches!(err, TrackError::InvalidPattern { .. }));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_dropped_handle_withdraws_request() {
        let tracker = StreamTracker::default();
        let handle = tracker.match_patterns(["never"]).unwrap();
        assert_eq!(tracker.outstanding(), 1);
        drop(handle);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_cancel_withdraws_request() {
        let tracker = StreamTracker::default();
        let handle = tracker.match_patterns(["never"]).unwrap();
        handle.cancel();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_stream_log_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StreamTracker::new(TrackerOptions {
            log_dir: Some(dir.path().join("logs")),
            ..TrackerOptions::default()
        });
        tracker
            .attach("launch-stdout", Cursor::new(b"x\ny\n".to_vec()))
            .unwrap();
        tracker.wait_close();

        let content = fs::read_to_string(dir.path().join("logs/launch-stdout.log")).unwrap();
        assert_eq!(content, "x\ny\n");
    }
}
