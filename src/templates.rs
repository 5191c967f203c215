use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::definition::{
    ArchiveSource, ArtifactKindSpec, ArtifactSpec, CommandSpec, DependencySource, DependencySpec,
    EnvironmentSpec, InstallerSpec, PipelineDefinition, PortableSpec, ProvenanceSpec, PublishSpec,
    SecretEntry, SecretsSpec, SigningServiceSpec, SigningSpec, SmokeCheckSpec, SmokeSpec,
    StageSpec,
};

pub const TEMPLATES: &[&str] = &["windows-installer", "portable", "minimal"];

const PLACEHOLDER_REVISION: &str = "0000000000000000000000000000000000000000";

pub fn template(name: &str) -> Result<PipelineDefinition> {
    match name {
        "windows-installer" => Ok(windows_installer()),
        "portable" => Ok(portable()),
        "minimal" => Ok(minimal()),
        other => anyhow::bail!(
            "Unknown template '{other}'. Available templates: {}",
            TEMPLATES.join(", ")
        ),
    }
}

pub fn generate_template(name: &str, destination: &Path) -> Result<PathBuf> {
    let definition = template(name)?;

    let rendered = serde_yaml::to_string(&definition)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered).with_context(|| {
        format!("Failed to write pipeline definition: {}", destination.display())
    })?;

    Ok(destination.to_path_buf())
}

/// Frozen desktop build with bundled media tools, an installer, signing
/// and a bounded detection workload as the smoke test.
fn windows_installer() -> PipelineDefinition {
    let mut secrets = BTreeMap::new();
    secrets.insert(
        "signing-token".to_string(),
        SecretEntry {
            path: PathBuf::from("secrets/signing-token.enc"),
        },
    );

    PipelineDefinition {
        version: 1,
        name: "scenedetect".into(),
        product_version: "0.6.4".into(),
        provenance: provenance(),
        environment: EnvironmentSpec {
            platform: "windows-x64".into(),
            toolchain: "pyinstaller".into(),
            variables: BTreeMap::from([("python".to_string(), "python".to_string())]),
        },
        secrets: SecretsSpec {
            entries: secrets,
            ..SecretsSpec::default()
        },
        dependencies: vec![
            archive_dependency(
                "ffmpeg",
                "https://example.invalid/ffmpeg-win64.tar.gz",
                "third-party/ffmpeg",
            ),
            archive_dependency(
                "mkvtoolnix",
                "https://example.invalid/mkvtoolnix-win64.tar.gz",
                "third-party/mkvtoolnix",
            ),
        ],
        stages: vec![
            stage(
                "install-requirements",
                vec![CommandSpec::new(
                    "{python}",
                    &["-m", "pip", "install", "-r", "dist/requirements_windows.txt"],
                )],
            ),
            StageSpec {
                path_prepend: vec![PathBuf::from("third-party/ffmpeg")],
                outputs: vec![PathBuf::from("dist/scenedetect/scenedetect{exe_suffix}")],
                timeout_secs: Some(1800),
                ..stage(
                    "freeze",
                    vec![CommandSpec::new(
                        "{toolchain}",
                        &["dist/scenedetect.spec", "--distpath", "dist"],
                    )],
                )
            },
        ],
        artifacts: vec![
            ArtifactSpec {
                name: "portable".into(),
                kind: ArtifactKindSpec::Portable(PortableSpec {
                    root: PathBuf::from("dist/scenedetect"),
                    sources: vec![PathBuf::from(".")],
                }),
                executable: Some(PathBuf::from("scenedetect.exe")),
            },
            ArtifactSpec {
                name: "installer".into(),
                kind: ArtifactKindSpec::Installer(InstallerSpec {
                    project: PathBuf::from("dist/installer/scenedetect.aip"),
                    builder: CommandSpec::new("installer-builder", &["/build", "{project}"]),
                    output: PathBuf::from("dist/installer/scenedetect-setup.msi"),
                    runtime_root: None,
                }),
                executable: None,
            },
        ],
        signing: Some(SigningSpec {
            service: SigningServiceSpec::DropBox {
                outbox: PathBuf::from("signing/outbox"),
                inbox: PathBuf::from("signing/inbox"),
            },
            credential: "signing-token".into(),
            artifacts: vec!["installer".into()],
            ledger: PathBuf::from("signing-ledger.jsonl"),
        }),
        smoke: Some(smoke("portable")),
        publish: publish(),
    }
}

fn portable() -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "scenedetect".into(),
        product_version: "0.6.4".into(),
        provenance: provenance(),
        environment: EnvironmentSpec {
            platform: "linux-x64".into(),
            toolchain: "pyinstaller".into(),
            variables: BTreeMap::new(),
        },
        secrets: SecretsSpec::default(),
        dependencies: Vec::new(),
        stages: vec![StageSpec {
            outputs: vec![PathBuf::from("dist/scenedetect/scenedetect")],
            timeout_secs: Some(1800),
            ..stage(
                "freeze",
                vec![CommandSpec::new(
                    "{toolchain}",
                    &["dist/scenedetect.spec", "--distpath", "dist"],
                )],
            )
        }],
        artifacts: vec![ArtifactSpec {
            name: "portable".into(),
            kind: ArtifactKindSpec::Portable(PortableSpec {
                root: PathBuf::from("dist/scenedetect"),
                sources: vec![PathBuf::from(".")],
            }),
            executable: Some(PathBuf::from("scenedetect")),
        }],
        signing: None,
        smoke: Some(smoke("portable")),
        publish: publish(),
    }
}

fn minimal() -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "example".into(),
        product_version: "0.1.0".into(),
        provenance: provenance(),
        environment: EnvironmentSpec {
            platform: "linux-x64".into(),
            toolchain: "pyinstaller".into(),
            variables: BTreeMap::new(),
        },
        secrets: SecretsSpec::default(),
        dependencies: Vec::new(),
        stages: vec![stage(
            "build",
            vec![CommandSpec::new("sh", &["-c", "echo build {name} {version}"])],
        )],
        artifacts: Vec::new(),
        signing: None,
        smoke: None,
        publish: publish(),
    }
}

fn provenance() -> ProvenanceSpec {
    ProvenanceSpec {
        revision: PLACEHOLDER_REVISION.into(),
        revision_env: crate::definition::DEFAULT_REVISION_ENV.into(),
    }
}

fn publish() -> PublishSpec {
    PublishSpec {
        directory: PathBuf::from("out/{version}"),
    }
}

fn stage(name: &str, commands: Vec<CommandSpec>) -> StageSpec {
    StageSpec {
        name: name.into(),
        commands,
        env: BTreeMap::new(),
        path_prepend: Vec::new(),
        outputs: Vec::new(),
        timeout_secs: None,
    }
}

fn archive_dependency(name: &str, url: &str, target: &str) -> DependencySpec {
    DependencySpec {
        name: name.into(),
        source: DependencySource::Archive(ArchiveSource {
            url: url.into(),
            sha256: None,
            strip_components: 1,
            auth_secret: None,
        }),
        target: PathBuf::from(target),
    }
}

fn smoke(artifact: &str) -> SmokeSpec {
    SmokeSpec {
        artifacts: vec![artifact.into()],
        checks: vec![
            SmokeCheckSpec {
                name: "version".into(),
                args: vec!["version".into()],
                expect_stdout: None,
                timeout_secs: Some(60),
            },
            SmokeCheckSpec {
                name: "detect-workload".into(),
                args: vec![
                    "-i".into(),
                    "tests/resources/testvideo.mp4".into(),
                    "time".into(),
                    "--end".into(),
                    "2s".into(),
                    "detect-content".into(),
                ],
                expect_stdout: None,
                timeout_secs: Some(300),
            },
        ],
    }
}
