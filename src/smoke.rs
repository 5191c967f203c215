use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::assembler::Artifact;
use crate::definition::SmokeCheckSpec;
use crate::error::{PipelineError, PipelineResult};
use crate::runner::{InvocationOptions, StageRunner};
use crate::toolchain::Toolchain;
use crate::workspace::WorkspaceContext;

#[derive(Debug, Clone, Serialize)]
pub struct SmokeResult {
    pub check: String,
    pub exit_code: i32,
    pub passed: bool,
    pub duration_ms: f64,
}

/// Last gate before publish: runs the packaged executable a few times.
pub struct SmokeTester<'a> {
    runner: &'a StageRunner,
    toolchain: &'a dyn Toolchain,
}

impl<'a> SmokeTester<'a> {
    pub fn new(runner: &'a StageRunner, toolchain: &'a dyn Toolchain) -> Self {
        Self { runner, toolchain }
    }

    /// Run `checks` in order against `artifact`'s executable. The first
    /// failing check ends testing; results gathered so far are appended to
    /// `results` either way.
    #[instrument(skip_all, fields(artifact = %artifact.name))]
    pub fn check(
        &self,
        artifact: &Artifact,
        checks: &[SmokeCheckSpec],
        ctx: &WorkspaceContext,
        results: &mut Vec<SmokeResult>,
    ) -> PipelineResult<()> {
        let executable = artifact.executable.as_ref().ok_or_else(|| {
            PipelineError::SmokeTestFailure {
                check: "<setup>".to_string(),
                reason: format!("artifact '{}' does not wrap an executable", artifact.name),
            }
        })?;

        for check in checks {
            let command = self.toolchain.smoke_command(executable, &check.args);
            let started = Instant::now();
            let outcome = self.runner.invoke(
                &command,
                ctx,
                InvocationOptions {
                    label: &check.name,
                    timeout: check.timeout_secs.map(Duration::from_secs),
                    capture_stdout: check.expect_stdout.is_some(),
                },
            );
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            let failure = |exit_code: i32, reason: String, results: &mut Vec<SmokeResult>| {
                self.runner.metrics().record_smoke(false);
                results.push(SmokeResult {
                    check: check.name.clone(),
                    exit_code,
                    passed: false,
                    duration_ms,
                });
                warn!(check = %check.name, %reason, "Smoke check failed");
                PipelineError::SmokeTestFailure {
                    check: check.name.clone(),
                    reason,
                }
            };

            let exit = match outcome {
                Ok(exit) => exit,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => return Err(failure(-1, err.to_string(), results)),
            };

            if !exit.success {
                return Err(failure(
                    exit.exit_code,
                    format!("`{}` exited with {}", command.display(), exit.exit_code),
                    results,
                ));
            }

            if let Some(expected) = &check.expect_stdout {
                let stdout = exit.stdout.unwrap_or_default();
                if !stdout.contains(expected.as_str()) {
                    return Err(failure(
                        exit.exit_code,
                        format!("output did not contain '{expected}'"),
                        results,
                    ));
                }
            }

            self.runner.metrics().record_smoke(true);
            info!(check = %check.name, duration_ms, "Smoke check passed");
            results.push(SmokeResult {
                check: check.name.clone(),
                exit_code: exit.exit_code,
                passed: true,
                duration_ms,
            });
        }

        Ok(())
    }
}
