use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub run_state: String,
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub commands_total: u64,
    pub commands_failed: u64,
    pub dependencies_staged: u64,
    pub artifacts_assembled: u64,
    pub smoke_passes: u64,
    pub smoke_failures: u64,
    pub failure_kind: Option<String>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            f(&mut guard);
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|snapshot| snapshot.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_state(&self, state: &str) {
        self.update(|snapshot| snapshot.run_state = state.to_string());
    }

    pub fn record_failure_kind(&self, kind: &str) {
        self.update(|snapshot| snapshot.failure_kind = Some(kind.to_string()));
    }

    pub fn record_command(&self, success: bool) {
        self.update(|snapshot| {
            snapshot.commands_total += 1;
            if !success {
                snapshot.commands_failed += 1;
            }
        });
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.update(|snapshot| {
            snapshot
                .stages
                .entry(stage.to_string())
                .or_default()
                .failures += 1;
        });
    }

    pub fn record_dependency(&self) {
        self.update(|snapshot| snapshot.dependencies_staged += 1);
    }

    pub fn record_artifact(&self) {
        self.update(|snapshot| snapshot.artifacts_assembled += 1);
    }

    pub fn record_smoke(&self, passed: bool) {
        self.update(|snapshot| {
            if passed {
                snapshot.smoke_passes += 1;
            } else {
                snapshot.smoke_failures += 1;
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|snapshot| *snapshot = MetricsSnapshot::default());
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        run_state = snapshot.run_state.as_str(),
        total_duration_ms = snapshot.total_duration_ms,
        commands_total = snapshot.commands_total,
        commands_failed = snapshot.commands_failed,
        dependencies_staged = snapshot.dependencies_staged,
        artifacts_assembled = snapshot.artifacts_assembled,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        };
        counter(
            "release_commands_total",
            "External tool invocations",
            self.commands_total,
        );
        counter(
            "release_commands_failed_total",
            "External tool invocations outside their success codes",
            self.commands_failed,
        );
        counter(
            "release_dependencies_staged_total",
            "Dependencies fetched and extracted",
            self.dependencies_staged,
        );
        counter(
            "release_artifacts_assembled_total",
            "Artifacts assembled",
            self.artifacts_assembled,
        );
        counter(
            "release_smoke_passes_total",
            "Smoke checks that passed",
            self.smoke_passes,
        );
        counter(
            "release_smoke_failures_total",
            "Smoke checks that failed",
            self.smoke_failures,
        );

        output.push_str("# HELP release_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE release_stage_calls_total counter\n");
        output.push_str("# HELP release_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE release_stage_failures_total counter\n");
        output.push_str(
            "# HELP release_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE release_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP release_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE release_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "release_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "release_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "release_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "release_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP release_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE release_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "release_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
