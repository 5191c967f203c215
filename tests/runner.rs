#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use release_pipeline::definition::{CommandSpec, StageSpec};
use release_pipeline::error::PipelineError;
use release_pipeline::observability::MetricsCollector;
use release_pipeline::runner::{SPAWN_FAILURE_EXIT_CODE, StageOutcome, StageRunner};
use release_pipeline::workspace::{CancellationToken, WorkspaceContext};
use tempfile::tempdir;

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", &["-c", script])
}

fn stage(name: &str, commands: Vec<CommandSpec>) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        commands,
        env: BTreeMap::new(),
        path_prepend: Vec::new(),
        outputs: Vec::new(),
        timeout_secs: None,
    }
}

#[test]
fn stage_stops_at_first_failing_command() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let spec = stage(
        "build",
        vec![
            sh("touch first"),
            sh("exit 4"),
            sh("touch never"),
        ],
    );
    let result = runner.run(&spec, &mut ctx).unwrap();

    assert!(!result.succeeded());
    assert_eq!(result.commands_run, 2);
    match &result.outcome {
        StageOutcome::Failed { command, exit_code } => {
            assert_eq!(command, "sh -c exit 4");
            assert_eq!(*exit_code, 4);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(temp.path().join("first").exists());
    assert!(!temp.path().join("never").exists());

    let err = result.into_result().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::CommandFailure { exit_code: 4, .. }
    ));
}

#[test]
fn declared_success_codes_are_honoured() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let mut command = sh("exit 1");
    command.success_codes = vec![0, 1];
    let result = runner.run(&stage("lenient", vec![command]), &mut ctx).unwrap();

    assert!(result.succeeded());
}

#[test]
fn search_path_extensions_reach_later_stages() {
    let temp = tempdir().unwrap();
    let tools = temp.path().join("tools/bin");
    std::fs::create_dir_all(&tools).unwrap();
    let helper = tools.join("greet");
    std::fs::write(&helper, "#!/bin/sh\necho hello > greeting.txt\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let mut setup = stage("setup", vec![sh("true")]);
    setup.path_prepend = vec![PathBuf::from("tools/bin")];
    setup.env.insert("GREETING_MODE".into(), "loud".into());
    runner.run(&setup, &mut ctx).unwrap().into_result().unwrap();

    let mut use_it = stage(
        "use",
        vec![sh("greet && test \"$GREETING_MODE\" = loud")],
    );
    use_it.outputs = vec![PathBuf::from("greeting.txt")];
    let result = runner.run(&use_it, &mut ctx).unwrap();

    assert!(result.succeeded());
    assert_eq!(ctx.produced_outputs(), &[temp.path().join("greeting.txt")]);
}

#[test]
fn missing_declared_output_is_a_missing_source() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let mut spec = stage("freeze", vec![sh("true")]);
    spec.outputs = vec![PathBuf::from("dist/app")];
    let err = runner.run(&spec, &mut ctx).unwrap_err();

    assert!(matches!(err, PipelineError::MissingSourceError(path) if path == PathBuf::from("dist/app")));
}

#[test]
fn unknown_program_reports_spawn_failure_code() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let spec = stage(
        "tools",
        vec![CommandSpec::new("definitely-not-a-real-tool-4242", &[])],
    );
    let result = runner.run(&spec, &mut ctx).unwrap();

    match result.outcome {
        StageOutcome::Failed { exit_code, .. } => assert_eq!(exit_code, SPAWN_FAILURE_EXIT_CODE),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn stage_timeout_kills_the_command() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let runner = StageRunner::new(MetricsCollector::new());

    let mut spec = stage("slow", vec![sh("sleep 30")]);
    spec.timeout_secs = Some(1);
    let started = std::time::Instant::now();
    let err = runner.run(&spec, &mut ctx).unwrap_err();

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    match err {
        PipelineError::StageTimeout {
            stage,
            timeout_secs,
            ..
        } => {
            assert_eq!(stage, "slow");
            assert_eq!(timeout_secs, 1);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn cancellation_interrupts_running_command() {
    let temp = tempdir().unwrap();
    let token = CancellationToken::new();
    let mut ctx = WorkspaceContext::new(temp.path()).with_cancellation(token.clone());
    let runner = StageRunner::new(MetricsCollector::new());

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        token.cancel();
    });
    let err = runner
        .run(&stage("long", vec![sh("sleep 30")]), &mut ctx)
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, PipelineError::Cancelled));
}

#[test]
fn metrics_count_commands_and_failures() {
    let temp = tempdir().unwrap();
    let mut ctx = WorkspaceContext::new(temp.path());
    let metrics = MetricsCollector::new();
    let runner = StageRunner::new(metrics.clone());

    runner
        .run(&stage("mixed", vec![sh("true"), sh("false")]), &mut ctx)
        .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.commands_total, 2);
    assert_eq!(snapshot.commands_failed, 1);
    assert_eq!(snapshot.stages["mixed"].calls, 1);
    assert_eq!(snapshot.stages["mixed"].failures, 1);
    assert!(snapshot.to_prometheus().contains("release_commands_total 2"));
}
