use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REVISION_ENV: &str = "PIPELINE_REVISION";
pub const DEFAULT_SECRET_KEY_ENV: &str = "PIPELINE_SECRET_KEY";
pub const DEFAULT_SECRET_SALT_ENV: &str = "PIPELINE_SECRET_SALT";

/// A release pipeline as written in its YAML definition file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineDefinition {
    pub version: u32,
    pub name: String,
    pub product_version: String,
    pub provenance: ProvenanceSpec,
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub secrets: SecretsSpec,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub signing: Option<SigningSpec>,
    #[serde(default)]
    pub smoke: Option<SmokeSpec>,
    pub publish: PublishSpec,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline definition: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactSpec> {
        self.artifacts.iter().find(|artifact| artifact.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvenanceSpec {
    pub revision: String,
    #[serde(default = "default_revision_env")]
    pub revision_env: String,
}

fn default_revision_env() -> String {
    DEFAULT_REVISION_ENV.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentSpec {
    pub platform: String,
    #[serde(default = "default_toolchain")]
    pub toolchain: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

fn default_toolchain() -> String {
    "pyinstaller".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsSpec {
    #[serde(default = "default_key_env")]
    pub key_env: String,
    #[serde(default = "default_salt_env")]
    pub salt_env: String,
    #[serde(default)]
    pub entries: BTreeMap<String, SecretEntry>,
}

impl Default for SecretsSpec {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            salt_env: default_salt_env(),
            entries: BTreeMap::new(),
        }
    }
}

fn default_key_env() -> String {
    DEFAULT_SECRET_KEY_ENV.to_string()
}

fn default_salt_env() -> String {
    DEFAULT_SECRET_SALT_ENV.to_string()
}

/// Location of one encrypted credential blob, relative to the workspace.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretEntry {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencySpec {
    pub name: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub source: DependencySource,
    #[serde(default = "default_target")]
    pub target: PathBuf,
}

fn default_target() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    Git(GitSource),
    Archive(ArchiveSource),
}

impl DependencySource {
    pub fn kind(&self) -> &'static str {
        match self {
            DependencySource::Git(_) => "git",
            DependencySource::Archive(_) => "archive",
        }
    }

    pub fn locator(&self) -> String {
        match self {
            DependencySource::Git(git) => {
                format!("{}@{}:{}", git.repository, git.reference, git.subpath)
            }
            DependencySource::Archive(archive) => archive.url.clone(),
        }
    }
}

/// Check out `subpath` from `reference` of `repository` into the workspace.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitSource {
    pub repository: String,
    pub reference: String,
    pub subpath: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveSource {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub strip_components: usize,
    #[serde(default)]
    pub auth_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub path_prepend: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: None,
            success_codes: default_success_codes(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactSpec {
    pub name: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub kind: ArtifactKindSpec,
    /// Path of the wrapped executable, relative to the artifact's runtime tree.
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKindSpec {
    Portable(PortableSpec),
    Installer(InstallerSpec),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortableSpec {
    pub root: PathBuf,
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallerSpec {
    pub project: PathBuf,
    pub builder: CommandSpec,
    pub output: PathBuf,
    #[serde(default)]
    pub runtime_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SigningSpec {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub service: SigningServiceSpec,
    pub credential: String,
    pub artifacts: Vec<String>,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
}

fn default_ledger() -> PathBuf {
    PathBuf::from("signing-ledger.jsonl")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningServiceSpec {
    DropBox { outbox: PathBuf, inbox: PathBuf },
    Http { endpoint: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmokeSpec {
    /// Artifacts whose wrapped executable is exercised by every check.
    pub artifacts: Vec<String>,
    pub checks: Vec<SmokeCheckSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmokeCheckSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub expect_stdout: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishSpec {
    pub directory: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAND_WRITTEN: &str = r#"
version: 1
name: scenedetect
product_version: 0.6.4
provenance:
  revision: cd1d1b6f0e7b2c4a9d8e3f1a2b3c4d5e6f708192
environment:
  platform: windows-x64
dependencies:
  - name: ffmpeg
    source:
      archive:
        url: https://cdn.example/ffmpeg-6.0.tar.gz
        strip_components: 1
  - name: resources
    source:
      git:
        repository: https://github.com/example/resources
        reference: main
        subpath: tests/resources
stages:
  - name: freeze
    commands:
      - program: pyinstaller
        args: [scenedetect.spec]
artifacts:
  - name: portable
    kind:
      portable:
        root: dist/scenedetect
        sources: [dist/scenedetect]
    executable: scenedetect.exe
  - name: installer
    kind:
      installer:
        project: installer/scenedetect.aip
        builder:
          program: AdvancedInstaller.com
          args: [/build, installer/scenedetect.aip]
        output: installer/out/scenedetect-setup.msi
signing:
  service:
    drop_box:
      outbox: signing/outbox
      inbox: signing/inbox
  credential: signing-token
  artifacts: [installer]
publish:
  directory: out
"#;

    #[test]
    fn single_key_maps_select_enum_variants() {
        let definition = PipelineDefinition::from_yaml(HAND_WRITTEN).unwrap();

        assert!(matches!(
            &definition.dependencies[0].source,
            DependencySource::Archive(archive) if archive.strip_components == 1
        ));
        assert!(matches!(
            &definition.dependencies[1].source,
            DependencySource::Git(git) if git.subpath == "tests/resources"
        ));
        assert_eq!(
            definition.dependencies[1].source.locator(),
            "https://github.com/example/resources@main:tests/resources"
        );
        assert!(matches!(
            definition.artifacts[0].kind,
            ArtifactKindSpec::Portable(_)
        ));
        assert!(matches!(
            definition.artifacts[1].kind,
            ArtifactKindSpec::Installer(_)
        ));
        let signing = definition.signing.as_ref().unwrap();
        assert!(matches!(
            &signing.service,
            SigningServiceSpec::DropBox { outbox, .. } if outbox == Path::new("signing/outbox")
        ));
        assert_eq!(signing.ledger, PathBuf::from("signing-ledger.jsonl"));
    }

    #[test]
    fn serialized_definition_uses_single_key_maps() {
        let definition = PipelineDefinition::from_yaml(HAND_WRITTEN).unwrap();
        let rendered = serde_yaml::to_string(&definition).unwrap();
        assert!(!rendered.contains('!'));
        assert!(rendered.contains("drop_box:"));
        let reloaded = PipelineDefinition::from_yaml(&rendered).unwrap();
        assert_eq!(reloaded.dependencies.len(), 2);
    }
}
