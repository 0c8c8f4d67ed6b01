//! Test milestone annotations.
//!
//! Annotations are posted on a detached thread. Failures are logged and
//! never reach the caller.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::{debug, warn};

/// Tag attached to every annotation.
pub const ANNOTATION_TAG: &str = "stacktest";

/// Receives test milestone markers.
pub trait Annotator: Send + Sync {
    /// Post `label`. Must not block on the remote side.
    fn post(&self, label: &str);
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationBody<'a> {
    time: i64,
    is_region: bool,
    tags: [&'a str; 1],
    text: &'a str,
}

/// Posts annotations to a grafana instance.
#[derive(Debug, Clone)]
pub struct GrafanaAnnotator {
    url: String,
    authorization: Option<String>,
    agent: ureq::Agent,
}

impl GrafanaAnnotator {
    pub fn new(base_url: &str, credentials: Option<(&str, &str)>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            url: format!("{}/api/annotations", base_url.trim_end_matches('/')),
            authorization: credentials.map(|(user, password)| basic_auth(user, password)),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, label: &str) -> Result<(), String> {
        let body = AnnotationBody {
            time: chrono::Utc::now().timestamp_millis(),
            is_region: false,
            tags: [ANNOTATION_TAG],
            text: label,
        };
        let payload = serde_json::to_string(&body).map_err(|e| e.to_string())?;

        let mut request = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth);
        }
        request.send(payload).map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl Annotator for GrafanaAnnotator {
    fn post(&self, label: &str) {
        let annotator = self.clone();
        let label = label.to_string();
        let spawned = thread::Builder::new()
            .name("annotate".to_string())
            .spawn(move || match annotator.send(&label) {
                Ok(()) => debug!(label, "annotation posted"),
                Err(e) => warn!(label, "failed to post annotation: {e}"),
            });
        if let Err(e) = spawned {
            warn!("could not spawn annotation thread: {e}");
        }
    }
}

fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// Annotator that only logs; used when no dashboard is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnotator;

impl Annotator for LogAnnotator {
    fn post(&self, label: &str) {
        debug!(label, "annotation");
    }
}

/// Keeps every label in memory, for tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingAnnotator {
    labels: Arc<Mutex<Vec<String>>>,
}

impl RecordingAnnotator {
    pub fn labels(&self) -> Vec<String> {
        self.labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Annotator for RecordingAnnotator {
    fn post(&self, label: &str) {
        self.labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(label.to_string());
    }
}
