//! Graphite render API client and response validators.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from a render query. Any of these counts as a failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] ureq::Error),

    #[error("Could not decode render response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A single `[value, timestamp]` pair. Graphite encodes gaps as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point(pub Option<f64>, pub i64);

impl Point {
    pub fn value(&self) -> Option<f64> {
        self.0
    }

    pub fn timestamp(&self) -> i64 {
        self.1
    }
}

/// One series of a render response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub target: String,
    #[serde(default)]
    pub datapoints: Vec<Point>,
}

/// A decoded render response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub series: Vec<Series>,
}

impl Response {
    /// Pretty JSON rendering for failure diagnostics.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// A source of render responses.
pub trait RenderApi: Send + Sync {
    fn render(&self, target: &str, from: &str) -> Result<Response, QueryError>;
}

/// Blocking client for the graphite render endpoint.
#[derive(Debug, Clone)]
pub struct GraphiteClient {
    base_url: String,
    agent: ureq::Agent,
}

impl GraphiteClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl RenderApi for GraphiteClient {
    /// Run `target` over the range starting at `from` (e.g. `-8s`).
    fn render(&self, target: &str, from: &str) -> Result<Response, QueryError> {
        let url = format!("{}/render", self.base_url);
        debug!(%url, target, from, "graphite render");
        let mut resp = self
            .agent
            .get(&url)
            .query("target", target)
            .query("from", from)
            .query("format", "json")
            .call()?;
        let status = resp.status().as_u16();
        let body = resp.body_mut().read_to_string()?;
        let series = parse_series(&body)?;
        Ok(Response { status, series })
    }
}

/// Decode the JSON body of a render response.
pub fn parse_series(body: &str) -> Result<Vec<Series>, serde_json::Error> {
    serde_json::from_str(body)
}

/// A numeric comparison used by value validators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparator {
    Ge(f64),
    Le(f64),
    Eq(f64),
}

pub fn ge(threshold: f64) -> Comparator {
    Comparator::Ge(threshold)
}

pub fn le(threshold: f64) -> Comparator {
    Comparator::Le(threshold)
}

pub fn eq(expected: f64) -> Comparator {
    Comparator::Eq(expected)
}

impl Comparator {
    pub fn check(&self, value: f64) -> bool {
        match *self {
            Self::Ge(t) => value >= t,
            Self::Le(t) => value <= t,
            Self::Eq(t) => value == t,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ge(t) => write!(f, ">= {t}"),
            Self::Le(t) => write!(f, "<= {t}"),
            Self::Eq(t) => write!(f, "== {t}"),
        }
    }
}

/// Series names must equal `expected`, in order.
pub fn validate_targets<I, S>(expected: I) -> impl Fn(&Response) -> bool + Send + Sync + 'static
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let expected: Vec<String> = expected.into_iter().map(Into::into).collect();
    move |resp: &Response| {
        resp.series.len() == expected.len()
            && resp
                .series
                .iter()
                .zip(&expected)
                .all(|(series, name)| &series.target == name)
    }
}

/// Every series has exactly `len` points and nulls only in the first
/// `prefix` positions.
pub fn validate_len_nulls(
    prefix: usize,
    len: usize,
) -> impl Fn(&Response) -> bool + Send + Sync + 'static {
    move |resp: &Response| {
        resp.series.iter().all(|series| {
            series.datapoints.len() == len
                && series
                    .datapoints
                    .iter()
                    .enumerate()
                    .all(|(i, p)| p.value().is_some() || i < prefix)
        })
    }
}

/// Every series has some window of `window` consecutive non-null values
/// whose average satisfies `cmp`. Series with fewer non-null values use
/// all of them as a single window.
pub fn validate_avg_windowed(
    window: usize,
    cmp: Comparator,
) -> impl Fn(&Response) -> bool + Send + Sync + 'static {
    move |resp: &Response| {
        !resp.series.is_empty()
            && resp.series.iter().all(|series| {
                let values: Vec<f64> = series.datapoints.iter().filter_map(Point::value).collect();
                if values.is_empty() {
                    return false;
                }
                let size = window.clamp(1, values.len());
                values
                    .windows(size)
                    .any(|w| cmp.check(w.iter().sum::<f64>() / size as f64))
            })
    }
}
