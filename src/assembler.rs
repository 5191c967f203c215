use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use serde::Serialize;
use tracing::{info, instrument};
use walkdir::WalkDir;

use crate::definition::{ArtifactKindSpec, ArtifactSpec, InstallerSpec, PortableSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::runner::{InvocationOptions, StageRunner};
use crate::security::compute_sha256;
use crate::toolchain::Toolchain;
use crate::workspace::WorkspaceContext;

pub const ARTIFACT_DIR: &str = "artifacts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Portable,
    Installer,
}

/// A named, distributable output of the run.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    /// Executable inside the runtime tree this artifact wraps, if any.
    pub executable: Option<PathBuf>,
    pub smoke_passed: bool,
}

impl Artifact {
    pub fn wraps_executable(&self) -> bool {
        self.executable.is_some()
    }

    /// Executable-wrapping artifacts must have passed the smoke test;
    /// pass-through bundles only need to exist.
    pub fn publishable(&self) -> bool {
        !self.wraps_executable() || self.smoke_passed
    }
}

pub struct ArtifactAssembler<'a> {
    runner: &'a StageRunner,
    toolchain: &'a dyn Toolchain,
    version: String,
}

impl<'a> ArtifactAssembler<'a> {
    pub fn new(runner: &'a StageRunner, toolchain: &'a dyn Toolchain, version: &str) -> Self {
        Self {
            runner,
            toolchain,
            version: version.to_string(),
        }
    }

    #[instrument(skip(self, spec, ctx), fields(artifact = %spec.name))]
    pub fn assemble(&self, spec: &ArtifactSpec, ctx: &WorkspaceContext) -> PipelineResult<Artifact> {
        ctx.cancellation().check()?;
        let output_dir = ctx.root().join(ARTIFACT_DIR);
        fs::create_dir_all(&output_dir).map_err(|err| PipelineError::io(&output_dir, err))?;

        let artifact = match &spec.kind {
            ArtifactKindSpec::Portable(portable) => {
                self.assemble_portable(spec, portable, &output_dir, ctx)?
            }
            ArtifactKindSpec::Installer(installer) => {
                self.assemble_installer(spec, installer, &output_dir, ctx)?
            }
        };

        self.runner.metrics().record_artifact();
        info!(
            file = %artifact.file_name,
            sha256 = %artifact.sha256,
            size_bytes = artifact.size_bytes,
            "Artifact assembled"
        );
        Ok(artifact)
    }

    fn assemble_portable(
        &self,
        spec: &ArtifactSpec,
        portable: &PortableSpec,
        output_dir: &Path,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<Artifact> {
        let root = ctx.resolve(&render_path(ctx, &portable.root));
        let sources: Vec<PathBuf> = portable
            .sources
            .iter()
            .map(|source| render_path(ctx, source))
            .collect();

        require_sources(&root, &sources)?;
        let executable = resolve_executable(spec, &root, ctx)?;

        let file_name = self
            .toolchain
            .artifact_file_name(&spec.name, &self.version, "tar.gz");
        let destination = output_dir.join(&file_name);
        write_portable_archive(&root, &sources, &destination)?;

        finish(spec, ArtifactKind::Portable, destination, file_name, executable)
    }

    fn assemble_installer(
        &self,
        spec: &ArtifactSpec,
        installer: &InstallerSpec,
        output_dir: &Path,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<Artifact> {
        let project = render_path(ctx, &installer.project);
        let project_path = ctx.resolve(&project);
        if !project_path.exists() {
            return Err(PipelineError::MissingSourceError(project));
        }

        let runtime_root = installer
            .runtime_root
            .as_ref()
            .map(|root| ctx.resolve(&render_path(ctx, root)));
        let executable = match &runtime_root {
            Some(root) => resolve_executable(spec, root, ctx)?,
            None => None,
        };

        let mut builder_ctx = ctx.clone();
        builder_ctx.set_variable("project", project_path.to_string_lossy().to_string());
        let label = format!("assemble:{}", spec.name);
        let exit = self.runner.invoke(
            &installer.builder,
            &builder_ctx,
            InvocationOptions {
                label: &label,
                timeout: None,
                capture_stdout: false,
            },
        )?;
        if !exit.success {
            return Err(PipelineError::CommandFailure {
                stage: label,
                command: installer.builder.display(),
                exit_code: exit.exit_code,
            });
        }

        let output = render_path(ctx, &installer.output);
        let built = ctx.resolve(&output);
        if !built.is_file() {
            return Err(PipelineError::MissingSourceError(output));
        }

        let extension = built
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_else(|| "bin".to_string());
        let file_name = self
            .toolchain
            .artifact_file_name(&spec.name, &self.version, &extension);
        let destination = output_dir.join(&file_name);
        fs::copy(&built, &destination).map_err(|err| PipelineError::io(&destination, err))?;

        finish(spec, ArtifactKind::Installer, destination, file_name, executable)
    }
}

fn render_path(ctx: &WorkspaceContext, path: &Path) -> PathBuf {
    PathBuf::from(ctx.render(&path.to_string_lossy()))
}

/// Fail on the first declared source that does not exist, in declaration
/// order, before anything is written.
fn require_sources(root: &Path, sources: &[PathBuf]) -> PipelineResult<()> {
    if !root.is_dir() {
        return Err(PipelineError::MissingSourceError(root.to_path_buf()));
    }
    for source in sources {
        if !root.join(source).exists() {
            return Err(PipelineError::MissingSourceError(source.clone()));
        }
    }
    Ok(())
}

fn resolve_executable(
    spec: &ArtifactSpec,
    root: &Path,
    ctx: &WorkspaceContext,
) -> PipelineResult<Option<PathBuf>> {
    let Some(executable) = &spec.executable else {
        return Ok(None);
    };
    let relative = render_path(ctx, executable);
    let resolved = root.join(&relative);
    if !resolved.is_file() {
        return Err(PipelineError::MissingSourceError(relative));
    }
    Ok(Some(resolved))
}

fn finish(
    spec: &ArtifactSpec,
    kind: ArtifactKind,
    path: PathBuf,
    file_name: String,
    executable: Option<PathBuf>,
) -> PipelineResult<Artifact> {
    let sha256 = compute_sha256(&path).map_err(|err| {
        PipelineError::io(&path, std::io::Error::other(err.to_string()))
    })?;
    let size_bytes = fs::metadata(&path)
        .map_err(|err| PipelineError::io(&path, err))?
        .len();
    Ok(Artifact {
        name: spec.name.clone(),
        kind,
        path,
        file_name,
        sha256,
        size_bytes,
        executable,
        smoke_passed: false,
    })
}

/// Write `sources` (relative to `root`) into a gzip'd tar whose bytes depend
/// only on file names, contents and the executable bit.
pub fn write_portable_archive(
    root: &Path,
    sources: &[PathBuf],
    destination: &Path,
) -> PipelineResult<()> {
    let mut entries: BTreeSet<(String, PathBuf, bool)> = BTreeSet::new();
    for source in sources {
        let start = root.join(source);
        for entry in WalkDir::new(&start).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                PipelineError::io(&start, std::io::Error::other(err.to_string()))
            })?;
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let name = archive_name(relative);
            if name.is_empty() {
                continue;
            }
            let is_dir = entry.file_type().is_dir();
            entries.insert((name, entry.path().to_path_buf(), is_dir));
        }
    }

    let partial = destination.with_extension("partial");
    let result = write_entries(&entries, &partial);
    match result {
        Ok(()) => fs::rename(&partial, destination)
            .map_err(|err| PipelineError::io(destination, err)),
        Err(err) => {
            let _ = fs::remove_file(&partial);
            Err(err)
        }
    }
}

fn write_entries(entries: &BTreeSet<(String, PathBuf, bool)>, path: &Path) -> PipelineResult<()> {
    let io_err = |err: std::io::Error| PipelineError::io(path, err);
    let file = File::create(path).map_err(io_err)?;
    let encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, source, is_dir) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        if *is_dir {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, format!("{name}/"), std::io::empty())
                .map_err(io_err)?;
        } else {
            let metadata = fs::metadata(source).map_err(io_err)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
            header.set_size(metadata.len());
            let reader = File::open(source).map_err(io_err)?;
            builder
                .append_data(&mut header, name, reader)
                .map_err(io_err)?;
        }
    }

    let encoder = builder.into_inner().map_err(io_err)?;
    encoder.finish().map_err(io_err)?;
    Ok(())
}

fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|part| match part {
            std::path::Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
