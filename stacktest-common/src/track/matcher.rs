//! Pattern matchers and match requests.
//!
//! A [`MatchRequest`] bundles a set of [`PatternMatcher`]s that must all see
//! a matching line before the request completes. Matchers are created fresh
//! for every request and never shared.

use std::sync::mpsc::SyncSender;

use regex::Regex;

use super::TrackError;

/// A single compiled pattern and whether it has matched yet.
#[derive(Debug)]
pub struct PatternMatcher {
    pattern: Regex,
    matched: bool,
}

impl PatternMatcher {
    /// Compile a new, unmatched matcher.
    pub fn new(pattern: &str) -> Result<Self, TrackError> {
        let pattern = Regex::new(pattern).map_err(|e| TrackError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern,
            matched: false,
        })
    }

    /// The source text of the pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// Evaluate a line. Once matched, the matcher is never evaluated again.
    ///
    /// Returns true only on the transition from unmatched to matched.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.matched {
            return false;
        }
        if self.pattern.is_match(line) {
            self.matched = true;
            return true;
        }
        false
    }
}

/// An outstanding set of matchers plus its one-shot completion signal.
#[derive(Debug)]
pub(crate) struct MatchRequest {
    pub(crate) id: u64,
    matchers: Vec<PatternMatcher>,
    signal: Option<SyncSender<()>>,
}

impl MatchRequest {
    pub(crate) fn new(id: u64, matchers: Vec<PatternMatcher>, signal: SyncSender<()>) -> Self {
        Self {
            id,
            matchers,
            signal: Some(signal),
        }
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        self.matchers.iter().all(PatternMatcher::is_matched)
    }

    /// Feed a line to every unmatched matcher.
    ///
    /// Returns true when the request became satisfied by this line. The
    /// completion signal is sent at most once over the request's lifetime.
    pub(crate) fn observe(&mut self, line: &str) -> bool {
        let mut progressed = false;
        for matcher in self.matchers.iter_mut() {
            if matcher.observe(line) {
                tracing::debug!(
                    request = self.id,
                    pattern = matcher.pattern(),
                    "pattern matched"
                );
                progressed = true;
            }
        }
        if !progressed || !self.is_satisfied() {
            return false;
        }
        match self.signal.take() {
            Some(signal) => {
                // Capacity one and a single send; a dropped receiver is fine.
                let _ = signal.try_send(());
                true
            }
            None => false,
        }
    }

    /// Patterns that have not matched yet, for diagnostics.
    pub(crate) fn pending(&self) -> Vec<String> {
        self.matchers
            .iter()
            .filter(|m| !m.is_matched())
            .map(|m| m.pattern().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    fn request(patterns: &[&str]) -> (MatchRequest, std::sync::mpsc::Receiver<()>) {
        let (tx, rx) = sync_channel(1);
        let matchers = patterns
            .iter()
            .map(|p| PatternMatcher::new(p).unwrap())
            .collect();
        (MatchRequest::new(1, matchers, tx), rx)
    }

    #[test]
    fn test_matcher_flips_once() {
        let mut matcher = PatternMatcher::new("ready$").unwrap();
        assert!(!matcher.observe("not yet"));
        assert!(matcher.observe("service ready"));
        assert!(matcher.is_matched());
        // Already matched: never re-evaluated, never reported again.
        assert!(!matcher.observe("service ready"));
        assert!(matcher.is_matched());
    }

    #[test]
    fn test_matcher_rejects_invalid_regex() {
        let err = PatternMatcher::new("unclosed(").unwrap_err();
        assert!(matches!(err, TrackError::InvalidPattern { .. }));
        assert!(err.to_string().contains("unclosed("));
    }

    #[test]
    fn test_request_needs_every_matcher() {
        let (mut req, rx) = request(&["B", "C"]);
        assert!(!req.observe("A"));
        assert!(!req.observe("B"));
        assert!(rx.try_recv().is_err());
        assert_eq!(req.pending(), vec!["C".to_string()]);
        assert!(req.observe("C"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_request_single_line_can_satisfy_all() {
        let (mut req, rx) = request(&["alpha", "beta"]);
        assert!(req.observe("alpha and beta"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_request_signals_at_most_once() {
        let (mut req, rx) = request(&["x"]);
        assert!(req.observe("x"));
        assert!(!req.observe("x"));
        assert!(rx.try_recv().is_ok());
        // Sender was consumed with the first notification.
        assert!(matches!(
            rx.try_recv(),
            Err(std::sync::mpsc::TryRecvError::Disconnected)
        ));
    }
}
