//! Explicit test-suite context.
//!
//! Holds the launched stack and every collaborator the cases talk to, so
//! cases receive what they need instead of reaching for globals.

use stacktest_common::fakemetrics::{CarbonWorkload, Workload};
use stacktest_common::grafana::{Annotator, GrafanaAnnotator, LogAnnotator};
use stacktest_common::graphite::{GraphiteClient, RenderApi};
use stacktest_common::process::SupervisorResult;
use stacktest_common::stack::StackLayout;
use stacktest_common::{MatchHandle, ProcessSupervisor, StackConfig, StreamTracker, TrackerOptions};
use tracing::info;

use crate::cases::READY_PATTERNS;

pub struct StackContext {
    pub config: StackConfig,
    pub stack: ProcessSupervisor,
    /// Readiness request registered before launch; taken by the startup case.
    pub readiness: Option<MatchHandle>,
    pub annotator: Box<dyn Annotator>,
    pub graphite: Box<dyn RenderApi>,
    pub workload: Box<dyn Workload>,
}

impl StackContext {
    pub fn new(
        config: StackConfig,
        stack: ProcessSupervisor,
        annotator: Box<dyn Annotator>,
        graphite: Box<dyn RenderApi>,
        workload: Box<dyn Workload>,
    ) -> Self {
        Self {
            config,
            stack,
            readiness: None,
            annotator,
            graphite,
            workload,
        }
    }

    /// Wire up the real stack: launch script, graphite, grafana and carbon.
    pub fn from_config(config: StackConfig) -> Self {
        let layout = StackLayout::new(config.stack_root.clone());
        let stack = ProcessSupervisor::new(
            "launch",
            layout.launch(&config.environment),
            tracker_options(&config),
        );

        let annotator: Box<dyn Annotator> = if config.grafana_url.is_empty() {
            Box::new(LogAnnotator)
        } else {
            Box::new(GrafanaAnnotator::new(
                &config.grafana_url,
                config.grafana_credentials(),
                config.http_timeout,
            ))
        };
        let graphite = Box::new(GraphiteClient::new(
            config.graphite_url.clone(),
            config.http_timeout,
        ));
        let workload = Box::new(CarbonWorkload::new(config.carbon_addr.clone()));

        Self::new(config, stack, annotator, graphite, workload)
    }

    /// Register the readiness request, then start the stack.
    ///
    /// Registering first means no readiness line can be missed between
    /// spawn and the startup case.
    pub fn launch(&mut self) -> SupervisorResult<u32> {
        self.readiness = Some(self.stack.tracker().match_patterns(READY_PATTERNS)?);
        let pid = self.stack.start()?;
        info!(pid, environment = %self.config.environment, "stack launched");
        Ok(pid)
    }

    pub fn tracker(&self) -> &StreamTracker {
        self.stack.tracker()
    }

    pub fn annotate(&self, label: &str) {
        self.annotator.post(label);
    }
}

/// Tracker settings for processes started on behalf of `config`.
pub fn tracker_options(config: &StackConfig) -> TrackerOptions {
    TrackerOptions {
        echo: config.echo_output,
        log_dir: config.log_dir.clone(),
        ..TrackerOptions::default()
    }
}
