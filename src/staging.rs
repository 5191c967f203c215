use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::definition::{ArchiveSource, CommandSpec, DependencySource, DependencySpec, GitSource};
use crate::error::{PipelineError, PipelineResult};
use crate::runner::{InvocationOptions, StageRunner};
use crate::secrets::SecretStore;
use crate::security::sha256_bytes;
use crate::workspace::WorkspaceContext;

const GIT_SCRATCH_DIR: &str = ".release-pipeline-git";

#[derive(Debug, Clone, Serialize)]
pub struct StagedDependency {
    pub name: String,
    pub kind: String,
    pub locator: String,
    pub target: PathBuf,
    pub files: Vec<PathBuf>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Tar,
    Gzip,
    Plain,
}

impl ArchiveFormat {
    fn detect(locator: &str) -> Self {
        let lower = file_name_of(locator).to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if lower.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if lower.ends_with(".gz") {
            ArchiveFormat::Gzip
        } else {
            ArchiveFormat::Plain
        }
    }
}

/// Fetches third-party resources into the workspace, in declaration order.
/// Later dependencies overwrite files written by earlier ones.
pub struct DependencyStager<'a> {
    runner: &'a StageRunner,
    secrets: &'a SecretStore,
    staged: BTreeMap<String, StagedDependency>,
    fetches: usize,
    client: Option<reqwest::blocking::Client>,
}

impl<'a> DependencyStager<'a> {
    pub fn new(runner: &'a StageRunner, secrets: &'a SecretStore) -> Self {
        Self {
            runner,
            secrets,
            staged: BTreeMap::new(),
            fetches: 0,
            client: None,
        }
    }

    /// Number of remote or local fetches performed so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn stage_all(
        &mut self,
        dependencies: &[DependencySpec],
        ctx: &mut WorkspaceContext,
    ) -> PipelineResult<Vec<StagedDependency>> {
        let mut staged = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            ctx.cancellation().check()?;
            staged.push(self.stage(dependency, ctx)?);
        }
        Ok(staged)
    }

    #[instrument(skip(self, dependency, ctx), fields(dependency = %dependency.name))]
    pub fn stage(
        &mut self,
        dependency: &DependencySpec,
        ctx: &mut WorkspaceContext,
    ) -> PipelineResult<StagedDependency> {
        if let Some(existing) = self.staged.get(&dependency.name) {
            debug!("Dependency already staged in this run");
            return Ok(existing.clone());
        }

        let target = ctx.resolve(&dependency.target);
        fs::create_dir_all(&target).map_err(|err| PipelineError::io(&target, err))?;

        let staged = match &dependency.source {
            DependencySource::Git(git) => self.stage_git(&dependency.name, git, &target, ctx)?,
            DependencySource::Archive(archive) => {
                self.stage_archive(&dependency.name, archive, &target, ctx)?
            }
        };

        info!(
            kind = dependency.source.kind(),
            files = staged.files.len(),
            target = %staged.target.display(),
            "Dependency staged"
        );
        self.runner.metrics().record_dependency();
        self.staged
            .insert(dependency.name.clone(), staged.clone());
        Ok(staged)
    }

    fn stage_git(
        &mut self,
        name: &str,
        git: &GitSource,
        target: &Path,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<StagedDependency> {
        let fetch_error = |reason: String| PipelineError::FetchError {
            dependency: name.to_string(),
            reason,
        };
        // Fetch into a private repository; the workspace's own repository and
        // index stay untouched.
        let target = &target
            .canonicalize()
            .map_err(|err| PipelineError::io(target, err))?;
        let scratch = target.join(GIT_SCRATCH_DIR);
        if scratch.exists() {
            fs::remove_dir_all(&scratch).map_err(|err| PipelineError::io(&scratch, err))?;
        }
        let scratch_arg = scratch.to_string_lossy().into_owned();
        let git_dir = format!("--git-dir={}", scratch.join(".git").display());
        let work_tree = format!("--work-tree={}", target.display());
        let commands = [
            CommandSpec::new("git", &["init", "--quiet", &scratch_arg]),
            CommandSpec::new(
                "git",
                &[
                    &git_dir,
                    "fetch",
                    "--quiet",
                    "--depth",
                    "1",
                    &git.repository,
                    &git.reference,
                ],
            ),
            CommandSpec::new(
                "git",
                &[&git_dir, &work_tree, "checkout", "FETCH_HEAD", "--", &git.subpath],
            ),
        ];

        self.fetches += 1;
        let mut outcome = Ok(());
        for command in &commands {
            let exit = self.runner.invoke(
                command,
                ctx,
                InvocationOptions {
                    label: name,
                    timeout: None,
                    capture_stdout: false,
                },
            );
            match exit {
                Ok(exit) if exit.success => {}
                Ok(exit) => {
                    outcome = Err(fetch_error(format!(
                        "`{}` exited with {}",
                        command.display(),
                        exit.exit_code
                    )));
                    break;
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        if scratch.exists()
            && let Err(err) = fs::remove_dir_all(&scratch)
        {
            warn!(path = %scratch.display(), error = %err, "Failed to remove git scratch repository");
        }
        outcome?;

        let checked_out = target.join(&git.subpath);
        let files = list_files(&checked_out);
        if files.is_empty() {
            return Err(fetch_error(format!(
                "subpath '{}' is empty at {}",
                git.subpath, git.reference
            )));
        }

        Ok(StagedDependency {
            name: name.to_string(),
            kind: "git".to_string(),
            locator: format!("{}@{}:{}", git.repository, git.reference, git.subpath),
            target: target.to_path_buf(),
            files,
            sha256: None,
        })
    }

    fn stage_archive(
        &mut self,
        name: &str,
        archive: &ArchiveSource,
        target: &Path,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<StagedDependency> {
        let url = ctx.render(&archive.url);
        self.fetches += 1;
        let bytes = self.fetch(name, &url, archive.auth_secret.as_deref(), ctx)?;
        let digest = sha256_bytes(&bytes);

        if let Some(expected) = &archive.sha256
            && !expected.eq_ignore_ascii_case(&digest)
        {
            return Err(PipelineError::FetchError {
                dependency: name.to_string(),
                reason: format!("sha256 mismatch: expected {expected}, downloaded {digest}"),
            });
        }

        let files = extract(name, &url, bytes, archive.strip_components, target)?;
        Ok(StagedDependency {
            name: name.to_string(),
            kind: "archive".to_string(),
            locator: url,
            target: target.to_path_buf(),
            files,
            sha256: Some(digest),
        })
    }

    fn fetch(
        &mut self,
        name: &str,
        url: &str,
        auth_secret: Option<&str>,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<Vec<u8>> {
        let fetch_error = |reason: String| PipelineError::FetchError {
            dependency: name.to_string(),
            reason,
        };

        if url.starts_with("http://") || url.starts_with("https://") {
            let client = self
                .client
                .get_or_insert_with(reqwest::blocking::Client::new)
                .clone();
            let request = client.get(url);
            let send = |request: reqwest::blocking::RequestBuilder| {
                request
                    .send()
                    .and_then(|response| response.error_for_status())
                    .and_then(|response| response.bytes())
                    .map(|bytes| bytes.to_vec())
                    .map_err(|err| fetch_error(format!("{url}: {err}")))
            };
            return match auth_secret {
                Some(reference) => self.secrets.with_secret(reference, |token| {
                    send(request.bearer_auth(token.expose_secret()))
                }),
                None => send(request),
            };
        }

        let path = match url.strip_prefix("file://") {
            Some(stripped) => PathBuf::from(stripped),
            None => ctx.resolve(Path::new(url)),
        };
        debug!(path = %path.display(), "Reading local archive");
        fs::read(&path).map_err(|err| fetch_error(format!("{}: {err}", path.display())))
    }
}

fn extract(
    name: &str,
    locator: &str,
    bytes: Vec<u8>,
    strip_components: usize,
    target: &Path,
) -> PipelineResult<Vec<PathBuf>> {
    let extract_error = |reason: String| PipelineError::ExtractError {
        dependency: name.to_string(),
        reason,
    };

    match ArchiveFormat::detect(locator) {
        ArchiveFormat::TarGz => unpack_tar(
            name,
            GzDecoder::new(Cursor::new(bytes)),
            strip_components,
            target,
        ),
        ArchiveFormat::Tar => unpack_tar(name, Cursor::new(bytes), strip_components, target),
        ArchiveFormat::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(Cursor::new(bytes))
                .read_to_end(&mut decoded)
                .map_err(|err| extract_error(format!("invalid gzip stream: {err}")))?;
            let file_name = file_name_of(locator)
                .trim_end_matches(".gz")
                .trim_end_matches(".GZ")
                .to_string();
            write_single(name, target, &file_name, &decoded)
        }
        ArchiveFormat::Plain => write_single(name, target, file_name_of(locator), &bytes),
    }
}

fn file_name_of(locator: &str) -> &str {
    let without_query = locator.split(['?', '#']).next().unwrap_or(locator);
    without_query
        .rsplit(['/', '\\'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("download")
}

fn write_single(
    name: &str,
    target: &Path,
    file_name: &str,
    bytes: &[u8],
) -> PipelineResult<Vec<PathBuf>> {
    let destination = target.join(file_name);
    fs::write(&destination, bytes).map_err(|err| PipelineError::ExtractError {
        dependency: name.to_string(),
        reason: format!("{}: {err}", destination.display()),
    })?;
    Ok(vec![destination])
}

fn unpack_tar<R: Read>(
    name: &str,
    reader: R,
    strip_components: usize,
    target: &Path,
) -> PipelineResult<Vec<PathBuf>> {
    let extract_error = |reason: String| PipelineError::ExtractError {
        dependency: name.to_string(),
        reason,
    };
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| extract_error(format!("unreadable archive: {err}")))?;

    let root = target
        .canonicalize()
        .map_err(|err| extract_error(format!("{}: {err}", target.display())))?;
    let mut files = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|err| extract_error(format!("corrupt entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| extract_error(format!("invalid entry path: {err}")))?
            .into_owned();
        let Some(relative) = sanitize_entry_path(&path, strip_components)
            .map_err(|reason| extract_error(reason))?
        else {
            continue;
        };

        let destination = target.join(&relative);
        ensure_within(&root, &destination).map_err(|reason| extract_error(reason))?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| extract_error(format!("{}: {err}", parent.display())))?;
        }

        let entry_type = entry.header().entry_type();
        let link_name = entry
            .link_name()
            .map_err(|err| extract_error(format!("invalid link in '{}': {err}", path.display())))?
            .map(|link| link.into_owned());
        if entry_type.is_hard_link() {
            let link = link_name.ok_or_else(|| {
                extract_error(format!("hard link '{}' has no target", path.display()))
            })?;
            let source = sanitize_entry_path(&link, strip_components)
                .map_err(|reason| extract_error(reason))?
                .map(|relative| target.join(relative))
                .ok_or_else(|| {
                    extract_error(format!("hard link '{}' has no target", path.display()))
                })?;
            ensure_within(&root, &source).map_err(|reason| extract_error(reason))?;
            if destination.is_file() {
                fs::remove_file(&destination)
                    .map_err(|err| extract_error(format!("{}: {err}", destination.display())))?;
            }
            fs::copy(&source, &destination)
                .map_err(|err| extract_error(format!("{}: {err}", relative.display())))?;
            files.push(destination);
            continue;
        }
        if entry_type.is_symlink() {
            let link = link_name.ok_or_else(|| {
                extract_error(format!("symlink '{}' has no target", path.display()))
            })?;
            check_symlink_target(&path, &link).map_err(|reason| extract_error(reason))?;
        }

        if entry_type.is_file() && destination.is_file() {
            // Overlay: the later dependency wins.
            fs::remove_file(&destination)
                .map_err(|err| extract_error(format!("{}: {err}", destination.display())))?;
        }
        entry
            .unpack(&destination)
            .map_err(|err| extract_error(format!("{}: {err}", relative.display())))?;
        if entry_type.is_file() {
            files.push(destination);
        }
    }

    if files.is_empty() {
        warn!(dependency = name, "Archive contained no regular files");
    }
    Ok(files)
}

/// Strip leading components and refuse anything that could escape the
/// target directory. `Ok(None)` means the entry is skipped.
fn sanitize_entry_path(path: &Path, strip_components: usize) -> Result<Option<PathBuf>, String> {
    let mut relative = PathBuf::new();
    for (index, component) in path.components().enumerate() {
        match component {
            Component::Normal(part) => {
                if index >= strip_components {
                    relative.push(part);
                }
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(format!(
                    "entry '{}' escapes the target directory",
                    path.display()
                ));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(relative))
    }
}

/// Symlinks may only point downward: no absolute targets, no `..`.
fn check_symlink_target(path: &Path, link: &Path) -> Result<(), String> {
    let escapes = link.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        Err(format!(
            "symlink '{}' -> '{}' escapes the target directory",
            path.display(),
            link.display()
        ))
    } else {
        Ok(())
    }
}

/// Refuse `destination` when its nearest existing ancestor resolves outside
/// `root`, which catches links already present in the tree.
fn ensure_within(root: &Path, destination: &Path) -> Result<(), String> {
    let mut ancestor = destination.parent();
    while let Some(candidate) = ancestor {
        if candidate.exists() {
            let resolved = candidate
                .canonicalize()
                .map_err(|err| format!("{}: {err}", candidate.display()))?;
            if resolved.starts_with(root) {
                return Ok(());
            }
            return Err(format!(
                "entry '{}' resolves outside the target directory",
                destination.display()
            ));
        }
        ancestor = candidate.parent();
    }
    Ok(())
}

fn list_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
