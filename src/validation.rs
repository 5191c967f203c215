use std::collections::BTreeSet;
use std::path::{Component, Path};

use serde::Serialize;

use crate::definition::{
    ArtifactKindSpec, DependencySource, PipelineDefinition, SigningServiceSpec, StageSpec,
};
use crate::toolchain::ToolchainRegistry;

pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_definition(
    definition: &PipelineDefinition,
    registry: &ToolchainRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.version != SUPPORTED_VERSION {
        report.errors.push(format!(
            "Unsupported definition version: {}",
            definition.version
        ));
    }

    if definition.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }
    if definition.product_version.trim().is_empty() {
        report.errors.push("Product version cannot be empty".into());
    }

    report.merge(validate_revision(&definition.provenance.revision));

    if let Err(err) = registry.select(&definition.environment) {
        report.errors.push(err.to_string());
    }

    report.merge(validate_dependencies(definition));

    if definition.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }
    let mut stage_names = BTreeSet::new();
    for (idx, stage) in definition.stages.iter().enumerate() {
        if !stage_names.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate stage name '{}'", stage.name));
        }
        report.merge(validate_stage(idx, stage));
    }

    report.merge(validate_artifacts(definition));
    report.merge(validate_signing(definition));
    report.merge(validate_smoke(definition));

    if definition.publish.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Publish directory cannot be empty".into());
    }

    report
}

fn validate_revision(revision: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    let trimmed = revision.trim();
    if trimmed.len() < 7 {
        report.errors.push(format!(
            "Pinned revision '{trimmed}' must have at least 7 hex characters"
        ));
    } else if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        report
            .errors
            .push(format!("Pinned revision '{trimmed}' is not a hex commit id"));
    } else if trimmed.len() < 40 {
        report
            .warnings
            .push("Pinned revision is abbreviated; prefer a full commit id".into());
    }
    report
}

fn validate_dependencies(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut names = BTreeSet::new();
    for dependency in &definition.dependencies {
        if !names.insert(dependency.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate dependency name '{}'", dependency.name));
        }
        if escapes_workspace(&dependency.target) {
            report.errors.push(format!(
                "Dependency '{}' target escapes the workspace: {}",
                dependency.name,
                dependency.target.display()
            ));
        }
        match &dependency.source {
            DependencySource::Git(git) => {
                if git.repository.trim().is_empty() || git.reference.trim().is_empty() {
                    report.errors.push(format!(
                        "Dependency '{}' needs a repository and a reference",
                        dependency.name
                    ));
                }
            }
            DependencySource::Archive(archive) => {
                if archive.url.trim().is_empty() {
                    report
                        .errors
                        .push(format!("Dependency '{}' has an empty url", dependency.name));
                }
                if archive.sha256.is_none() {
                    report.warnings.push(format!(
                        "Dependency '{}' is not pinned by sha256",
                        dependency.name
                    ));
                }
                if let Some(secret) = &archive.auth_secret
                    && !definition.secrets.entries.contains_key(secret)
                {
                    report.errors.push(format!(
                        "Dependency '{}' references unknown secret '{secret}'",
                        dependency.name
                    ));
                }
            }
        }
    }
    report
}

fn validate_stage(idx: usize, stage: &StageSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = format!("Stage {} ('{}')", idx + 1, stage.name);
    if stage.name.trim().is_empty() {
        report.errors.push(format!("{label}: name cannot be empty"));
    }
    if stage.commands.is_empty() {
        report
            .errors
            .push(format!("{label}: must contain at least one command"));
    }
    for command in &stage.commands {
        if command.program.trim().is_empty() {
            report
                .errors
                .push(format!("{label}: command program cannot be empty"));
        }
        if command.success_codes.is_empty() {
            report.errors.push(format!(
                "{label}: `{}` declares no success codes",
                command.display()
            ));
        }
    }
    if stage.timeout_secs == Some(0) {
        report
            .errors
            .push(format!("{label}: timeout_secs must be positive"));
    }
    report
}

fn validate_artifacts(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut names = BTreeSet::new();
    for artifact in &definition.artifacts {
        if !names.insert(artifact.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate artifact name '{}'", artifact.name));
        }
        match &artifact.kind {
            ArtifactKindSpec::Portable(portable) => {
                if portable.sources.is_empty() {
                    report.errors.push(format!(
                        "Artifact '{}' declares no sources",
                        artifact.name
                    ));
                }
                for source in &portable.sources {
                    if escapes_workspace(source) || source.is_absolute() {
                        report.errors.push(format!(
                            "Artifact '{}' source must be relative to its root: {}",
                            artifact.name,
                            source.display()
                        ));
                    }
                }
            }
            ArtifactKindSpec::Installer(installer) => {
                if installer.builder.program.trim().is_empty() {
                    report.errors.push(format!(
                        "Artifact '{}' has an empty builder program",
                        artifact.name
                    ));
                }
                if artifact.executable.is_some() && installer.runtime_root.is_none() {
                    report.errors.push(format!(
                        "Artifact '{}' wraps an executable but declares no runtime_root",
                        artifact.name
                    ));
                }
            }
        }
    }
    report
}

fn validate_signing(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(signing) = &definition.signing else {
        if !definition.artifacts.is_empty() {
            report
                .warnings
                .push("No signing section; artifacts will be published unsigned".into());
        }
        return report;
    };

    if !definition.secrets.entries.contains_key(&signing.credential) {
        report.errors.push(format!(
            "Signing credential '{}' is not a declared secret",
            signing.credential
        ));
    }
    if signing.artifacts.is_empty() {
        report
            .errors
            .push("Signing section selects no artifacts".into());
    }
    for name in &signing.artifacts {
        if definition.artifact(name).is_none() {
            report
                .errors
                .push(format!("Signing references unknown artifact '{name}'"));
        }
    }
    if let SigningServiceSpec::Http { endpoint } = &signing.service
        && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
    {
        report
            .errors
            .push(format!("Signing endpoint '{endpoint}' is not an http(s) url"));
    }
    report
}

fn validate_smoke(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let tested: BTreeSet<&str> = definition
        .smoke
        .as_ref()
        .map(|smoke| smoke.artifacts.iter().map(String::as_str).collect())
        .unwrap_or_default();

    if let Some(smoke) = &definition.smoke {
        if smoke.checks.is_empty() {
            report
                .errors
                .push("Smoke section declares no checks".into());
        }
        for name in &smoke.artifacts {
            match definition.artifact(name) {
                None => report
                    .errors
                    .push(format!("Smoke test references unknown artifact '{name}'")),
                Some(artifact) if artifact.executable.is_none() => report.errors.push(format!(
                    "Smoke test artifact '{name}' does not wrap an executable"
                )),
                Some(_) => {}
            }
        }
        if smoke.checks.iter().all(|check| check.timeout_secs.is_none()) {
            report
                .warnings
                .push("No smoke check is bounded by timeout_secs".into());
        }
    }

    for artifact in &definition.artifacts {
        if artifact.executable.is_some() && !tested.contains(artifact.name.as_str()) {
            report.errors.push(format!(
                "Artifact '{}' wraps an executable but is not smoke-tested; it could never be published",
                artifact.name
            ));
        }
    }
    report
}

fn escapes_workspace(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}
