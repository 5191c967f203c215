use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::assembler::{ARTIFACT_DIR, ArtifactAssembler};
use crate::observability::MetricsSnapshot;
use crate::pipeline::PipelineExecutor;
use crate::provenance::RevisionSource;
use crate::secrets::SecretStore;
use crate::security::digest_tree;
use crate::staging::DependencyStager;
use crate::workspace::CancellationToken;

/// Directories never copied into the comparison workspaces.
const SKIPPED_DIRS: &[&str] = &[".git", "target", ARTIFACT_DIR];

#[derive(Debug)]
pub struct ReproducibilityOptions {
    pub source: PathBuf,
    pub scratch: PathBuf,
    /// Revision the source tree is expected to be checked out at.
    pub revision: RevisionSource,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct OutputComparison {
    pub path: String,
    pub first: Option<String>,
    pub second: Option<String>,
    pub matches: bool,
}

#[derive(Debug, Serialize)]
pub struct ArtifactComparison {
    pub name: String,
    pub first: String,
    pub second: String,
    pub matches: bool,
}

#[derive(Debug, Serialize)]
pub struct ReproducibilityReport {
    pub pipeline: String,
    pub revision: String,
    pub reproducible: bool,
    pub outputs: Vec<OutputComparison>,
    pub artifacts: Vec<ArtifactComparison>,
    pub duration_ms: f64,
    pub metrics: MetricsSnapshot,
}

struct BuildDigest {
    outputs: BTreeMap<String, String>,
    artifacts: BTreeMap<String, String>,
}

/// Build the same source twice in separate copies and compare the digests of
/// every declared stage output and every assembled artifact.
#[instrument(skip_all, fields(pipeline = %executor.definition().name))]
pub fn verify_reproducible(
    executor: &PipelineExecutor,
    options: &ReproducibilityOptions,
) -> Result<ReproducibilityReport> {
    let started = Instant::now();
    executor.metrics().reset();
    let revision = executor.verify_provenance(&options.revision, &options.source)?;

    let mut digests = Vec::with_capacity(2);
    for label in ["first", "second"] {
        let workspace = options.scratch.join(label);
        if workspace.exists() {
            fs::remove_dir_all(&workspace).with_context(|| {
                format!("Failed to clear scratch workspace: {}", workspace.display())
            })?;
        }
        copy_tree(&options.source, &workspace)?;
        info!(
            build = label,
            %revision,
            workspace = %workspace.display(),
            "Reproducibility build started"
        );
        digests.push(build_once(executor, &workspace, &options.cancellation)?);
    }
    let second = digests.pop().ok_or_else(|| anyhow!("second build missing"))?;
    let first = digests.pop().ok_or_else(|| anyhow!("first build missing"))?;

    let outputs = compare_outputs(&first.outputs, &second.outputs);
    let artifacts: Vec<ArtifactComparison> = first
        .artifacts
        .iter()
        .map(|(name, digest)| {
            let other = second.artifacts.get(name).cloned().unwrap_or_default();
            ArtifactComparison {
                name: name.clone(),
                matches: *digest == other,
                first: digest.clone(),
                second: other,
            }
        })
        .collect();

    let reproducible = outputs.iter().all(|o| o.matches) && artifacts.iter().all(|a| a.matches);
    if !reproducible {
        for output in outputs.iter().filter(|o| !o.matches) {
            warn!(path = %output.path, "Output differs between builds");
        }
        for artifact in artifacts.iter().filter(|a| !a.matches) {
            warn!(artifact = %artifact.name, "Artifact differs between builds");
        }
    }

    Ok(ReproducibilityReport {
        pipeline: executor.definition().name.clone(),
        revision,
        reproducible,
        outputs,
        artifacts,
        duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
        metrics: executor.metrics().snapshot(),
    })
}

fn build_once(
    executor: &PipelineExecutor,
    workspace: &Path,
    cancellation: &CancellationToken,
) -> Result<BuildDigest> {
    let definition = executor.definition();
    let mut ctx = executor.workspace_context(workspace, cancellation.clone());
    let secrets = SecretStore::from_env(&definition.secrets, workspace);

    let mut stager = DependencyStager::new(executor.runner(), &secrets);
    stager.stage_all(&definition.dependencies, &mut ctx)?;

    for stage in &definition.stages {
        executor.runner().run(stage, &mut ctx)?.into_result()?;
    }

    let assembler = ArtifactAssembler::new(
        executor.runner(),
        executor.toolchain(),
        &definition.product_version,
    );
    let mut artifacts = BTreeMap::new();
    for spec in &definition.artifacts {
        let artifact = assembler.assemble(spec, &ctx)?;
        artifacts.insert(artifact.name, artifact.sha256);
    }

    let mut outputs = BTreeMap::new();
    for produced in ctx.produced_outputs() {
        let prefix = produced
            .strip_prefix(workspace)
            .unwrap_or(produced)
            .to_string_lossy()
            .replace('\\', "/");
        for (relative, digest) in digest_tree(produced)? {
            let key = if produced.is_file() {
                prefix.clone()
            } else {
                format!("{prefix}/{relative}")
            };
            outputs.insert(key, digest);
        }
    }

    Ok(BuildDigest { outputs, artifacts })
}

fn compare_outputs(
    first: &BTreeMap<String, String>,
    second: &BTreeMap<String, String>,
) -> Vec<OutputComparison> {
    let mut paths: Vec<&String> = first.keys().chain(second.keys()).collect();
    paths.sort();
    paths.dedup();
    paths
        .into_iter()
        .map(|path| {
            let a = first.get(path).cloned();
            let b = second.get(path).cloned();
            OutputComparison {
                path: path.clone(),
                matches: a.is_some() && a == b,
                first: a,
                second: b,
            }
        })
        .collect()
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir()
                && SKIPPED_DIRS
                    .iter()
                    .any(|skip| entry.file_name() == std::ffi::OsStr::new(skip)))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk source: {}", source.display()))?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_side_never_matches() {
        let mut first = BTreeMap::new();
        first.insert("dist/app".to_string(), "aa".to_string());
        first.insert("dist/lib".to_string(), "bb".to_string());
        let mut second = BTreeMap::new();
        second.insert("dist/app".to_string(), "aa".to_string());

        let comparisons = compare_outputs(&first, &second);
        assert_eq!(comparisons.len(), 2);
        assert!(comparisons[0].matches);
        assert!(!comparisons[1].matches);
        assert_eq!(comparisons[1].second, None);
    }
}
