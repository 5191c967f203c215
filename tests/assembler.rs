use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use release_pipeline::assembler::{ArtifactAssembler, ArtifactKind, write_portable_archive};
use release_pipeline::definition::{
    ArtifactKindSpec, ArtifactSpec, CommandSpec, EnvironmentSpec, InstallerSpec, PortableSpec,
};
use release_pipeline::error::PipelineError;
use release_pipeline::observability::MetricsCollector;
use release_pipeline::runner::StageRunner;
use release_pipeline::security::compute_sha256;
use release_pipeline::toolchain::ToolchainRegistry;
use release_pipeline::workspace::WorkspaceContext;
use tempfile::tempdir;

fn environment(platform: &str) -> EnvironmentSpec {
    EnvironmentSpec {
        platform: platform.to_string(),
        toolchain: "pyinstaller".to_string(),
        variables: BTreeMap::new(),
    }
}

fn portable(sources: &[&str], executable: Option<&str>) -> ArtifactSpec {
    ArtifactSpec {
        name: "portable".to_string(),
        kind: ArtifactKindSpec::Portable(PortableSpec {
            root: PathBuf::from("dist/app"),
            sources: sources.iter().map(PathBuf::from).collect(),
        }),
        executable: executable.map(PathBuf::from),
    }
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn portable_artifact_keeps_logical_name_and_versioned_file_name() {
    let temp = tempdir().unwrap();
    write(temp.path(), "dist/app/app.exe", "binary");
    write(temp.path(), "dist/app/lib/codec.dll", "library");

    let registry = ToolchainRegistry::default();
    let toolchain = registry.select(&environment("windows-x64")).unwrap();
    let runner = StageRunner::new(MetricsCollector::new());
    let assembler = ArtifactAssembler::new(&runner, toolchain.as_ref(), "1.2.0");
    let ctx = WorkspaceContext::new(temp.path());

    let artifact = assembler
        .assemble(&portable(&["app.exe", "lib"], Some("app.exe")), &ctx)
        .unwrap();

    assert_eq!(artifact.name, "portable");
    assert_eq!(artifact.kind, ArtifactKind::Portable);
    assert_eq!(artifact.file_name, "portable-1.2.0-windows-x64.tar.gz");
    assert_eq!(artifact.sha256, compute_sha256(&artifact.path).unwrap());
    assert_eq!(artifact.executable, Some(temp.path().join("dist/app/app.exe")));
    assert!(artifact.wraps_executable());
    assert!(!artifact.publishable());
    assert_eq!(runner.metrics().snapshot().artifacts_assembled, 1);
}

#[test]
fn first_missing_source_is_reported_in_declaration_order() {
    let temp = tempdir().unwrap();
    write(temp.path(), "dist/app/present.txt", "here");

    let registry = ToolchainRegistry::default();
    let toolchain = registry.select(&environment("linux-x64")).unwrap();
    let runner = StageRunner::new(MetricsCollector::new());
    let assembler = ArtifactAssembler::new(&runner, toolchain.as_ref(), "1.2.0");
    let ctx = WorkspaceContext::new(temp.path());
    let spec = portable(&["present.txt", "second-missing", "third-missing"], None);

    for _ in 0..2 {
        let err = assembler.assemble(&spec, &ctx).unwrap_err();
        match err {
            PipelineError::MissingSourceError(path) => {
                assert_eq!(path, PathBuf::from("second-missing"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
    let leftovers: Vec<_> = fs::read_dir(temp.path().join("artifacts"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn portable_archives_are_byte_identical_across_builds() {
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    for root in [first.path(), second.path()] {
        write(root, "tree/b.txt", "bravo");
        write(root, "tree/a/nested.txt", "alpha");
    }
    // Different mtimes must not leak into the archive.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write(second.path(), "tree/b.txt", "bravo");

    let out_first = first.path().join("first.tar.gz");
    let out_second = second.path().join("second.tar.gz");
    write_portable_archive(&first.path().join("tree"), &[PathBuf::from(".")], &out_first).unwrap();
    write_portable_archive(&second.path().join("tree"), &[PathBuf::from(".")], &out_second)
        .unwrap();

    assert_eq!(fs::read(&out_first).unwrap(), fs::read(&out_second).unwrap());
}

#[cfg(unix)]
#[test]
fn installer_policy_runs_builder_and_collects_output() {
    let temp = tempdir().unwrap();
    write(temp.path(), "installer/product.aip", "<project/>");

    let registry = ToolchainRegistry::default();
    let toolchain = registry.select(&environment("windows-x64")).unwrap();
    let runner = StageRunner::new(MetricsCollector::new());
    let assembler = ArtifactAssembler::new(&runner, toolchain.as_ref(), "1.2.0");
    let ctx = WorkspaceContext::new(temp.path());

    let spec = ArtifactSpec {
        name: "installer".to_string(),
        kind: ArtifactKindSpec::Installer(InstallerSpec {
            project: PathBuf::from("installer/product.aip"),
            builder: CommandSpec::new("sh", &["-c", "cp {project} installer/setup.msi"]),
            output: PathBuf::from("installer/setup.msi"),
            runtime_root: None,
        }),
        executable: None,
    };
    let artifact = assembler.assemble(&spec, &ctx).unwrap();

    assert_eq!(artifact.kind, ArtifactKind::Installer);
    assert_eq!(artifact.file_name, "installer-1.2.0-windows-x64.msi");
    assert!(artifact.publishable());
    assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "<project/>");
}

#[cfg(unix)]
#[test]
fn installer_builder_failure_is_a_command_failure() {
    let temp = tempdir().unwrap();
    write(temp.path(), "installer/product.aip", "<project/>");

    let registry = ToolchainRegistry::default();
    let toolchain = registry.select(&environment("windows-x64")).unwrap();
    let runner = StageRunner::new(MetricsCollector::new());
    let assembler = ArtifactAssembler::new(&runner, toolchain.as_ref(), "1.2.0");
    let ctx = WorkspaceContext::new(temp.path());

    let spec = ArtifactSpec {
        name: "installer".to_string(),
        kind: ArtifactKindSpec::Installer(InstallerSpec {
            project: PathBuf::from("installer/product.aip"),
            builder: CommandSpec::new("sh", &["-c", "exit 2"]),
            output: PathBuf::from("installer/setup.msi"),
            runtime_root: None,
        }),
        executable: None,
    };
    let err = assembler.assemble(&spec, &ctx).unwrap_err();

    assert!(matches!(
        err,
        PipelineError::CommandFailure { ref stage, exit_code: 2, .. } if stage == "assemble:installer"
    ));
}
