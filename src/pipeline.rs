use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::assembler::{Artifact, ArtifactAssembler};
use crate::definition::{PipelineDefinition, SmokeSpec};
use crate::error::{FailureKind, PipelineError, PipelineResult};
use crate::observability::MetricsCollector;
use crate::provenance::{ProvenanceGate, ProvenanceRecord, RevisionSource};
use crate::runner::{StageResult, StageRunner};
use crate::secrets::SecretStore;
use crate::security::{ManifestEntry, ManifestEntryKind, write_release_manifest, write_sha256};
use crate::signing::{ReleaseIdentity, SigningHandoff, SigningLedger, SigningState, build_service};
use crate::smoke::{SmokeResult, SmokeTester};
use crate::staging::{DependencyStager, StagedDependency};
use crate::toolchain::{Toolchain, ToolchainRegistry};
use crate::workspace::{CancellationToken, WorkspaceContext};

pub const PUBLISH_MANIFEST: &str = "manifest.json";
pub const RELEASE_BOM: &str = "bom.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Verifying,
    Staging,
    Building,
    Assembling,
    SigningSubmitted,
    Testing,
    Succeeded,
    Failed,
}

impl RunState {
    const ORDER: [RunState; 8] = [
        RunState::Pending,
        RunState::Verifying,
        RunState::Staging,
        RunState::Building,
        RunState::Assembling,
        RunState::SigningSubmitted,
        RunState::Testing,
        RunState::Succeeded,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Verifying => "verifying",
            RunState::Staging => "staging",
            RunState::Building => "building",
            RunState::Assembling => "assembling",
            RunState::SigningSubmitted => "signing_submitted",
            RunState::Testing => "testing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    fn successor(&self) -> Option<RunState> {
        let index = Self::ORDER.iter().position(|state| state == self)?;
        Self::ORDER.get(index + 1).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentDescriptor {
    pub platform: String,
    pub toolchain: String,
    pub host_os: String,
    pub host_arch: String,
    pub variables: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// State the run was in when the failure happened.
    pub during: RunState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub name: String,
    pub file_name: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// One execution of a pipeline definition and everything it produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: String,
    pub product: String,
    pub version: String,
    pub pinned_revision: String,
    pub environment: EnvironmentDescriptor,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub stages: Vec<StageResult>,
    pub dependencies: Vec<StagedDependency>,
    pub artifacts: Vec<Artifact>,
    pub signing: Option<SigningState>,
    pub smoke: Vec<SmokeResult>,
    pub published: Vec<PublishedArtifact>,
    pub failure: Option<FailureRecord>,
    pub secrets_resolved: usize,
    pub dependencies_fetched: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(definition: &PipelineDefinition, environment: EnvironmentDescriptor) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            product: definition.name.clone(),
            version: definition.product_version.clone(),
            pinned_revision: definition.provenance.revision.clone(),
            environment,
            state: RunState::Pending,
            history: vec![RunState::Pending],
            stages: Vec::new(),
            dependencies: Vec::new(),
            artifacts: Vec::new(),
            signing: None,
            smoke: Vec::new(),
            published: Vec::new(),
            failure: None,
            secrets_resolved: 0,
            dependencies_fetched: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|artifact| artifact.name == name)
    }

    /// Advance to `next`. Only the immediate successor or `Failed` is
    /// accepted, and nothing leaves a terminal state.
    fn transition(&mut self, next: RunState) -> PipelineResult<()> {
        let allowed = !self.state.is_terminal()
            && (next == RunState::Failed || self.state.successor() == Some(next));
        if !allowed {
            return Err(PipelineError::InvalidDefinition(format!(
                "illegal run transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            )));
        }
        info!(from = self.state.as_str(), to = next.as_str(), "Run state changed");
        self.state = next;
        self.history.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    fn fail(&mut self, err: &PipelineError) {
        let during = self.state;
        self.failure = Some(FailureRecord {
            kind: err.kind(),
            during,
            message: err.to_string(),
        });
        if !self.state.is_terminal() {
            let _ = self.transition(RunState::Failed);
        }
    }

    pub fn write_report(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }
}

/// Key and salt for the secret store, when not taken from the environment.
pub struct SecretInputs {
    pub key: Zeroizing<Vec<u8>>,
    pub salt: Zeroizing<Vec<u8>>,
}

pub struct RunOptions {
    pub workspace: PathBuf,
    pub revision: RevisionSource,
    pub cancellation: CancellationToken,
    pub secret_inputs: Option<SecretInputs>,
}

impl RunOptions {
    pub fn new(workspace: impl Into<PathBuf>, revision: RevisionSource) -> Self {
        Self {
            workspace: workspace.into(),
            revision,
            cancellation: CancellationToken::new(),
            secret_inputs: None,
        }
    }

    pub fn with_secret_inputs(mut self, key: &[u8], salt: &[u8]) -> Self {
        self.secret_inputs = Some(SecretInputs {
            key: Zeroizing::new(key.to_vec()),
            salt: Zeroizing::new(salt.to_vec()),
        });
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

pub struct PipelineExecutor {
    definition: PipelineDefinition,
    toolchain: Box<dyn Toolchain>,
    runner: StageRunner,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(definition: PipelineDefinition, registry: &ToolchainRegistry) -> Result<Self> {
        let toolchain = registry.select(&definition.environment)?;
        let metrics = MetricsCollector::new();
        Ok(Self {
            definition,
            toolchain,
            runner: StageRunner::new(metrics.clone()),
            metrics,
        })
    }

    /// Report into `metrics` instead of a private collector.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.runner = StageRunner::new(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn environment(&self) -> EnvironmentDescriptor {
        let mut variables = self.definition.environment.variables.clone();
        variables.extend(self.toolchain.build_variables());
        EnvironmentDescriptor {
            platform: self.toolchain.platform().to_string(),
            toolchain: self.toolchain.tool().to_string(),
            host_os: std::env::consts::OS.to_string(),
            host_arch: std::env::consts::ARCH.to_string(),
            variables,
        }
    }

    /// Workspace context seeded with the definition's and toolchain's
    /// template variables.
    pub fn workspace_context(&self, root: &Path, token: CancellationToken) -> WorkspaceContext {
        let mut ctx = WorkspaceContext::new(root).with_cancellation(token);
        for (key, value) in self.environment().variables {
            ctx.set_variable(key, value);
        }
        ctx.set_variable("name", self.definition.name.clone());
        ctx.set_variable("version", self.definition.product_version.clone());
        ctx
    }

    /// Gate on the pinned revision. Nothing may be staged before this passes.
    pub fn verify_provenance(
        &self,
        source: &RevisionSource,
        workspace: &Path,
    ) -> PipelineResult<String> {
        let record = ProvenanceRecord::new(&self.definition.provenance.revision)?;
        ProvenanceGate::check(&record, source, workspace)
    }

    /// Run the whole pipeline. Failures never escape as errors: they end the
    /// run in `Failed` with the first failure recorded.
    #[instrument(skip_all, fields(pipeline = %self.definition.name))]
    pub fn execute(&self, options: RunOptions) -> PipelineRun {
        self.metrics.reset();
        let started = Instant::now();
        let mut run = PipelineRun::new(&self.definition, self.environment());
        self.metrics.record_state(run.state.as_str());
        let mut ctx = self.workspace_context(&options.workspace, options.cancellation.clone());

        let outcome = self.drive(&mut run, &mut ctx, &options);
        match outcome {
            Ok(()) => {
                if let Err(err) = run.transition(RunState::Succeeded) {
                    run.fail(&err);
                }
            }
            Err(err) => {
                error!(kind = err.kind().as_str(), "Pipeline failed: {err}");
                self.metrics.record_failure_kind(err.kind().as_str());
                run.fail(&err);
            }
        }

        self.metrics.record_state(run.state.as_str());
        self.metrics.record_total_duration(started.elapsed());
        info!(
            run = %run.id,
            state = run.state.as_str(),
            artifacts = run.artifacts.len(),
            "Pipeline finished"
        );
        run
    }

    fn enter(&self, run: &mut PipelineRun, state: RunState) -> PipelineResult<()> {
        run.transition(state)?;
        self.metrics.record_state(state.as_str());
        Ok(())
    }

    fn drive(
        &self,
        run: &mut PipelineRun,
        ctx: &mut WorkspaceContext,
        options: &RunOptions,
    ) -> PipelineResult<()> {
        let definition = &self.definition;
        ctx.ensure_root()?;

        self.enter(run, RunState::Verifying)?;
        let actual = self.verify_provenance(&options.revision, ctx.root())?;

        self.enter(run, RunState::Staging)?;
        let secrets = match &options.secret_inputs {
            Some(inputs) => SecretStore::new(
                ctx.root(),
                definition
                    .secrets
                    .entries
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.path.clone()))
                    .collect(),
                Some(inputs.key.clone()),
                Some(inputs.salt.clone()),
            ),
            None => SecretStore::from_env(&definition.secrets, ctx.root()),
        };
        let result = self.stage_and_build(run, ctx, &secrets, &actual);
        run.secrets_resolved = secrets.resolution_count();
        result
    }

    fn stage_and_build(
        &self,
        run: &mut PipelineRun,
        ctx: &mut WorkspaceContext,
        secrets: &SecretStore,
        revision: &str,
    ) -> PipelineResult<()> {
        let definition = &self.definition;

        let mut stager = DependencyStager::new(&self.runner, secrets);
        let staged = stager.stage_all(&definition.dependencies, ctx);
        run.dependencies_fetched = stager.fetch_count();
        run.dependencies = staged?;

        self.enter(run, RunState::Building)?;
        for stage in &definition.stages {
            ctx.cancellation().check()?;
            let result = self.runner.run(stage, ctx)?;
            run.stages.push(result.clone());
            result.into_result()?;
        }

        self.enter(run, RunState::Assembling)?;
        let assembler =
            ArtifactAssembler::new(&self.runner, self.toolchain.as_ref(), &definition.product_version);
        for spec in &definition.artifacts {
            let artifact = assembler.assemble(spec, ctx)?;
            run.artifacts.push(artifact);
        }

        self.enter(run, RunState::SigningSubmitted)?;
        if let Some(signing) = &definition.signing {
            let selected: Vec<&Artifact> = signing
                .artifacts
                .iter()
                .map(|name| {
                    run.artifact(name).ok_or_else(|| {
                        PipelineError::SigningSubmissionError(format!(
                            "artifact '{name}' was not assembled"
                        ))
                    })
                })
                .collect::<PipelineResult<_>>()?;
            let service = build_service(&signing.service, ctx);
            let handoff = SigningHandoff::new(
                secrets,
                service.as_ref(),
                self.toolchain.as_ref(),
                SigningLedger::new(ctx.resolve(&signing.ledger)),
            );
            let identity = ReleaseIdentity {
                product: definition.name.clone(),
                version: definition.product_version.clone(),
                revision: revision.to_string(),
            };
            let state = handoff.submit(&selected, &signing.credential, &identity, ctx)?;
            run.signing = Some(state);
        } else {
            warn!("No signing configured; artifacts will be published unsigned");
        }

        self.enter(run, RunState::Testing)?;
        if let Some(smoke) = &definition.smoke {
            self.smoke_test(run, smoke, ctx)?;
        }

        self.publish(run, ctx)
    }

    fn smoke_test(
        &self,
        run: &mut PipelineRun,
        smoke: &SmokeSpec,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<()> {
        let tester = SmokeTester::new(&self.runner, self.toolchain.as_ref());
        for name in &smoke.artifacts {
            let index = run
                .artifacts
                .iter()
                .position(|artifact| &artifact.name == name)
                .ok_or_else(|| PipelineError::SmokeTestFailure {
                    check: "<setup>".to_string(),
                    reason: format!("artifact '{name}' was not assembled"),
                })?;
            let artifact = run.artifacts[index].clone();
            tester.check(&artifact, &smoke.checks, ctx, &mut run.smoke)?;
            run.artifacts[index].smoke_passed = true;
        }
        Ok(())
    }

    /// Copy every artifact into the publish directory with digest sidecars,
    /// a logical-name manifest and a release BOM.
    fn publish(&self, run: &mut PipelineRun, ctx: &WorkspaceContext) -> PipelineResult<()> {
        let definition = &self.definition;
        let directory = ctx.resolve(Path::new(&ctx.render(
            &definition.publish.directory.to_string_lossy(),
        )));

        if let Some(blocked) = run.artifacts.iter().find(|artifact| !artifact.publishable()) {
            return Err(PipelineError::SmokeTestFailure {
                check: "<publish>".to_string(),
                reason: format!(
                    "artifact '{}' wraps an executable that was never smoke-tested",
                    blocked.name
                ),
            });
        }

        fs::create_dir_all(&directory).map_err(|err| PipelineError::io(&directory, err))?;
        let to_io = |path: &Path, err: anyhow::Error| {
            PipelineError::io(path, std::io::Error::other(err.to_string()))
        };

        let mut published = Vec::with_capacity(run.artifacts.len());
        for artifact in &run.artifacts {
            let destination = directory.join(&artifact.file_name);
            fs::copy(&artifact.path, &destination)
                .map_err(|err| PipelineError::io(&destination, err))?;
            let sidecar = directory.join(format!("{}.sha256", artifact.file_name));
            let sha256 = write_sha256(&destination, &sidecar).map_err(|err| to_io(&sidecar, err))?;
            published.push(PublishedArtifact {
                name: artifact.name.clone(),
                file_name: artifact.file_name.clone(),
                path: destination,
                sha256,
            });
        }

        let manifest = serde_json::json!({
            "product": definition.name,
            "version": definition.product_version,
            "revision": definition.provenance.revision,
            "platform": self.toolchain.platform(),
            "run": run.id,
            "artifacts": published
                .iter()
                .map(|p| (p.name.clone(), serde_json::json!({
                    "file": p.file_name,
                    "sha256": p.sha256,
                })))
                .collect::<serde_json::Map<_, _>>(),
            "signing": run.signing,
        });
        let manifest_path = directory.join(PUBLISH_MANIFEST);
        let rendered = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| PipelineError::io(&manifest_path, std::io::Error::other(err)))?;
        fs::write(&manifest_path, rendered).map_err(|err| PipelineError::io(&manifest_path, err))?;

        let mut entries: Vec<ManifestEntry> = run
            .dependencies
            .iter()
            .map(|dependency| ManifestEntry {
                name: dependency.name.clone(),
                kind: ManifestEntryKind::Dependency,
                locator: Some(dependency.locator.clone()),
                sha256: dependency.sha256.clone(),
            })
            .collect();
        entries.extend(published.iter().map(|p| ManifestEntry {
            name: p.name.clone(),
            kind: ManifestEntryKind::Artifact,
            locator: None,
            sha256: Some(p.sha256.clone()),
        }));
        let bom_path = directory.join(RELEASE_BOM);
        write_release_manifest(
            &definition.name,
            &definition.product_version,
            &entries,
            &bom_path,
        )
        .map_err(|err| to_io(&bom_path, err))?;

        info!(
            directory = %directory.display(),
            artifacts = published.len(),
            "Artifacts published"
        );
        run.published = published;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_advance_one_step_at_a_time() {
        assert_eq!(RunState::Pending.successor(), Some(RunState::Verifying));
        assert_eq!(RunState::Testing.successor(), Some(RunState::Succeeded));
        assert_eq!(RunState::Succeeded.successor(), None);
        assert_eq!(RunState::Failed.successor(), None);
    }
}
