use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::definition::{CommandSpec, StageSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::observability::MetricsCollector;
use crate::workspace::WorkspaceContext;

/// Exit code reported when the program could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
/// Exit code reported when the process was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed { command: String, exit_code: i32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub name: String,
    pub outcome: StageOutcome,
    pub commands_run: usize,
    pub duration_ms: f64,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StageOutcome::Succeeded)
    }

    /// Convert a failed outcome into the run-ending error.
    pub fn into_result(self) -> PipelineResult<StageResult> {
        match &self.outcome {
            StageOutcome::Succeeded => Ok(self),
            StageOutcome::Failed { command, exit_code } => Err(PipelineError::CommandFailure {
                stage: self.name.clone(),
                command: command.clone(),
                exit_code: *exit_code,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandExit {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: Option<String>,
}

/// Options for a single external tool invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions<'a> {
    pub label: &'a str,
    pub timeout: Option<Duration>,
    pub capture_stdout: bool,
}

/// Runs stages command by command, stopping at the first failure.
#[derive(Debug, Clone)]
pub struct StageRunner {
    metrics: MetricsCollector,
    poll_interval: Duration,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(MetricsCollector::new())
    }
}

impl StageRunner {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            metrics,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run every command of `stage` in order.
    ///
    /// Returns `Ok` with a failed outcome when a command exits outside its
    /// success codes; returns `Err` for timeouts, cancellation and missing
    /// declared outputs.
    #[instrument(skip(self, stage, ctx), fields(stage = %stage.name))]
    pub fn run(&self, stage: &StageSpec, ctx: &mut WorkspaceContext) -> PipelineResult<StageResult> {
        let _timer = self.metrics.start_stage(&stage.name);
        let started = Instant::now();

        for (key, value) in &stage.env {
            ctx.set_env(key.clone(), value.clone());
        }
        for dir in &stage.path_prepend {
            let rendered = PathBuf::from(ctx.render(&dir.to_string_lossy()));
            ctx.prepend_path(&rendered);
        }

        let deadline = stage
            .timeout_secs
            .map(|secs| (started + Duration::from_secs(secs), secs));
        let mut commands_run = 0usize;

        for command in &stage.commands {
            ctx.cancellation().check()?;
            let timeout = match deadline {
                Some((deadline, secs)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PipelineError::StageTimeout {
                            stage: stage.name.clone(),
                            command: command.display(),
                            timeout_secs: secs,
                        });
                    }
                    Some(remaining)
                }
                None => None,
            };

            let exit = self
                .invoke(
                    command,
                    ctx,
                    InvocationOptions {
                        label: &stage.name,
                        timeout,
                        capture_stdout: false,
                    },
                )
                .map_err(|err| match err {
                    PipelineError::StageTimeout { command, .. } => PipelineError::StageTimeout {
                        stage: stage.name.clone(),
                        command,
                        timeout_secs: deadline.map(|(_, secs)| secs).unwrap_or_default(),
                    },
                    other => other,
                })?;
            commands_run += 1;

            if !exit.success {
                warn!(
                    command = %command.display(),
                    exit_code = exit.exit_code,
                    "Command failed; aborting stage"
                );
                self.metrics.record_stage_failure(&stage.name);
                return Ok(StageResult {
                    name: stage.name.clone(),
                    outcome: StageOutcome::Failed {
                        command: command.display(),
                        exit_code: exit.exit_code,
                    },
                    commands_run,
                    duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
                });
            }
        }

        for output in &stage.outputs {
            let rendered = PathBuf::from(ctx.render(&output.to_string_lossy()));
            let resolved = ctx.resolve(&rendered);
            if !resolved.exists() {
                self.metrics.record_stage_failure(&stage.name);
                return Err(PipelineError::MissingSourceError(rendered));
            }
            ctx.record_output(resolved);
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
        info!(commands = commands_run, duration_ms, "Stage succeeded");
        Ok(StageResult {
            name: stage.name.clone(),
            outcome: StageOutcome::Succeeded,
            commands_run,
            duration_ms,
        })
    }

    /// Spawn one external tool and block until it exits, the timeout
    /// elapses or the run is cancelled.
    pub fn invoke(
        &self,
        spec: &CommandSpec,
        ctx: &WorkspaceContext,
        options: InvocationOptions<'_>,
    ) -> PipelineResult<CommandExit> {
        let program = resolve_program(&ctx.render(&spec.program), ctx);
        let args: Vec<String> = spec.args.iter().map(|arg| ctx.render(arg)).collect();
        let cwd = spec
            .cwd
            .as_ref()
            .map(|dir| ctx.resolve(Path::new(&ctx.render(&dir.to_string_lossy()))))
            .unwrap_or_else(|| ctx.root().to_path_buf());

        let span = tracing::span!(
            tracing::Level::DEBUG,
            "command",
            program = %program.display(),
            label = options.label
        );
        let _guard = span.enter();
        debug!(?args, cwd = %cwd.display(), "Spawning command");

        let mut command = Command::new(&program);
        command.args(&args).current_dir(&cwd).envs(ctx.command_env()?);
        if options.capture_stdout {
            command.stdout(Stdio::piped());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, "Failed to start command");
                self.metrics.record_command(false);
                return Ok(CommandExit {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    success: false,
                    stdout: None,
                });
            }
        };

        let reader = if options.capture_stdout {
            child.stdout.take().map(|mut stdout| {
                std::thread::spawn(move || {
                    let mut buffer = String::new();
                    let _ = stdout.read_to_string(&mut buffer);
                    buffer
                })
            })
        } else {
            None
        };

        let status = self.wait(&mut child, ctx, options.timeout, &spec.display());
        let stdout = reader.and_then(|handle| handle.join().ok());
        let status = status?;

        let exit_code = status.code().unwrap_or(SIGNAL_EXIT_CODE);
        let success = status.code().is_some() && spec.success_codes.contains(&exit_code);
        self.metrics.record_command(success);
        debug!(exit_code, success, "Command finished");

        Ok(CommandExit {
            exit_code,
            success,
            stdout,
        })
    }

    fn wait(
        &self,
        child: &mut Child,
        ctx: &WorkspaceContext,
        timeout: Option<Duration>,
        command_line: &str,
    ) -> PipelineResult<std::process::ExitStatus> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            if ctx.cancellation().is_cancelled() {
                warn!(command = %command_line, "Cancellation requested; killing command");
                terminate(child);
                return Err(PipelineError::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!(command = %command_line, "Timeout elapsed; killing command");
                terminate(child);
                return Err(PipelineError::StageTimeout {
                    stage: String::new(),
                    command: command_line.to_string(),
                    timeout_secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
            match child
                .wait_timeout(self.poll_interval)
                .map_err(|err| PipelineError::io(command_line, err))?
            {
                Some(status) => return Ok(status),
                None => continue,
            }
        }
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Programs given as relative paths are looked up in the workspace; bare
/// names go through the search path.
fn resolve_program(program: &str, ctx: &WorkspaceContext) -> PathBuf {
    let path = Path::new(program);
    if path.components().count() > 1 && !path.is_absolute() {
        ctx.resolve(path)
    } else {
        path.to_path_buf()
    }
}
