use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::definition::{PipelineDefinition, StageSpec};

pub const DEFAULT_LOCKFILE: &str = "pipeline.lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub definition_version: u32,
    pub generated_at: DateTime<Utc>,
    pub product: String,
    pub product_version: String,
    pub revision: String,
    pub platform: String,
    pub dependencies: Vec<DependencyLock>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyLock {
    pub name: String,
    pub kind: String,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub commands_hash: String,
}

impl PipelineLock {
    pub fn from_definition(definition: &PipelineDefinition) -> Self {
        let dependencies = definition
            .dependencies
            .iter()
            .map(|dependency| DependencyLock {
                name: dependency.name.clone(),
                kind: dependency.source.kind().to_string(),
                locator: dependency.source.locator(),
                sha256: match &dependency.source {
                    crate::definition::DependencySource::Archive(archive) => {
                        archive.sha256.clone()
                    }
                    crate::definition::DependencySource::Git(_) => None,
                },
            })
            .collect();

        let stages = definition
            .stages
            .iter()
            .map(|stage| StageLock {
                name: stage.name.clone(),
                commands_hash: hash_commands(stage),
            })
            .collect();

        Self {
            definition_version: definition.version,
            generated_at: Utc::now(),
            product: definition.name.clone(),
            product_version: definition.product_version.clone(),
            revision: definition.provenance.revision.trim().to_ascii_lowercase(),
            platform: definition.environment.platform.clone(),
            dependencies,
            stages,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open lockfile: {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
    }

    /// Differences between this lock and `definition`, one line per drift.
    pub fn drift(&self, definition: &PipelineDefinition) -> Vec<String> {
        let current = Self::from_definition(definition);
        let mut drift = Vec::new();
        if self.revision != current.revision {
            drift.push(format!(
                "revision changed: {} -> {}",
                self.revision, current.revision
            ));
        }
        if self.platform != current.platform {
            drift.push(format!(
                "platform changed: {} -> {}",
                self.platform, current.platform
            ));
        }
        for locked in &self.dependencies {
            match current.dependencies.iter().find(|d| d.name == locked.name) {
                None => drift.push(format!("dependency '{}' removed", locked.name)),
                Some(now) if now.locator != locked.locator || now.sha256 != locked.sha256 => {
                    drift.push(format!("dependency '{}' changed", locked.name))
                }
                Some(_) => {}
            }
        }
        for now in &current.dependencies {
            if !self.dependencies.iter().any(|d| d.name == now.name) {
                drift.push(format!("dependency '{}' added", now.name));
            }
        }
        let locked_stages: Vec<_> = self.stages.iter().map(|s| (&s.name, &s.commands_hash)).collect();
        let current_stages: Vec<_> = current
            .stages
            .iter()
            .map(|s| (&s.name, &s.commands_hash))
            .collect();
        if locked_stages != current_stages {
            drift.push("stage commands changed".to_string());
        }
        drift
    }
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<PipelineLock> {
    let lock = PipelineLock::from_definition(definition);

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

fn hash_commands(stage: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.name.as_bytes());
    for command in &stage.commands {
        hasher.update([0u8]);
        hasher.update(command.program.as_bytes());
        for arg in &command.args {
            hasher.update([0x1f]);
            hasher.update(arg.as_bytes());
        }
        if let Some(cwd) = &command.cwd {
            hasher.update([0x1e]);
            hasher.update(cwd.to_string_lossy().as_bytes());
        }
    }
    for path in &stage.path_prepend {
        hasher.update([0x1d]);
        hasher.update(path.to_string_lossy().as_bytes());
    }
    for (key, value) in &stage.env {
        hasher.update([0x1c]);
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
