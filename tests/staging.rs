#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::Compression;
use flate2::write::GzEncoder;
use release_pipeline::definition::{ArchiveSource, DependencySource, DependencySpec, GitSource};
use release_pipeline::error::PipelineError;
use release_pipeline::observability::MetricsCollector;
use release_pipeline::runner::StageRunner;
use release_pipeline::secrets::SecretStore;
use release_pipeline::security::sha256_bytes;
use release_pipeline::staging::DependencyStager;
use release_pipeline::workspace::WorkspaceContext;
use tempfile::tempdir;

enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a Path),
}

fn write_tar_gz(path: &Path, entries: &[Entry<'_>]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            Entry::File(name, contents) => {
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                builder.append_data(&mut header, name, *contents).unwrap();
            }
            Entry::Symlink(name, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, name, target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn archive(name: &str, path: &Path, target: &str) -> DependencySpec {
    DependencySpec {
        name: name.to_string(),
        source: DependencySource::Archive(ArchiveSource {
            url: format!("file://{}", path.display()),
            sha256: None,
            strip_components: 0,
            auth_secret: None,
        }),
        target: PathBuf::from(target),
    }
}

fn no_secrets(root: &Path) -> SecretStore {
    SecretStore::new(root, BTreeMap::new(), None, None)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=Release Bot", "-c", "user.email=release@example.invalid"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn later_archive_overwrites_earlier_files() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let base = root.join("downloads/base.tar.gz");
    let patch = root.join("downloads/patch.tar.gz");
    write_tar_gz(
        &base,
        &[
            Entry::File("bin/tool", b"base tool"),
            Entry::File("share/readme.txt", b"base readme"),
        ],
    );
    write_tar_gz(&patch, &[Entry::File("bin/tool", b"patched tool")]);

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);
    let mut stager = DependencyStager::new(&runner, &secrets);
    let staged = stager
        .stage_all(
            &[
                archive("base", &base, "third-party"),
                archive("patch", &patch, "third-party"),
            ],
            &mut ctx,
        )
        .unwrap();

    assert_eq!(staged.len(), 2);
    assert_eq!(stager.fetch_count(), 2);
    assert_eq!(
        fs::read_to_string(root.join("third-party/bin/tool")).unwrap(),
        "patched tool"
    );
    assert_eq!(
        fs::read_to_string(root.join("third-party/share/readme.txt")).unwrap(),
        "base readme"
    );
}

#[test]
fn pinned_archive_digest_is_enforced() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let path = root.join("downloads/ffmpeg.tar.gz");
    write_tar_gz(&path, &[Entry::File("bin/ffmpeg", b"ffmpeg 6.0")]);
    let actual = sha256_bytes(&fs::read(&path).unwrap());

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);

    let mut pinned = archive("ffmpeg", &path, "third-party/ffmpeg");
    if let DependencySource::Archive(source) = &mut pinned.source {
        source.sha256 = Some("00".repeat(32));
    }
    let err = DependencyStager::new(&runner, &secrets)
        .stage(&pinned, &mut ctx)
        .unwrap_err();
    assert!(matches!(err, PipelineError::FetchError { ref dependency, .. } if dependency == "ffmpeg"));
    assert!(err.to_string().contains("sha256 mismatch"));
    assert!(!root.join("third-party/ffmpeg/bin/ffmpeg").exists());

    if let DependencySource::Archive(source) = &mut pinned.source {
        source.sha256 = Some(actual.to_uppercase());
    }
    let staged = DependencyStager::new(&runner, &secrets)
        .stage(&pinned, &mut ctx)
        .unwrap();
    assert_eq!(staged.sha256.as_deref(), Some(actual.as_str()));
    assert!(root.join("third-party/ffmpeg/bin/ffmpeg").is_file());
}

#[test]
fn symlink_out_of_the_target_is_rejected() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let outside = root.join("outside");
    fs::create_dir_all(&outside).unwrap();
    let path = root.join("downloads/evil.tar.gz");
    write_tar_gz(
        &path,
        &[
            Entry::Symlink("link", &outside),
            Entry::File("link/pwned", b"pwned"),
        ],
    );

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);
    let err = DependencyStager::new(&runner, &secrets)
        .stage(&archive("evil", &path, "third-party"), &mut ctx)
        .unwrap_err();

    assert!(matches!(err, PipelineError::ExtractError { .. }));
    assert!(!outside.join("pwned").exists());
    assert!(fs::symlink_metadata(root.join("third-party/link")).is_err());
}

#[test]
fn symlink_climbing_with_parent_components_is_rejected() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let path = root.join("downloads/evil.tar.gz");
    write_tar_gz(
        &path,
        &[
            Entry::Symlink("up", Path::new("../..")),
            Entry::File("up/pwned", b"pwned"),
        ],
    );

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);
    let err = DependencyStager::new(&runner, &secrets)
        .stage(&archive("evil", &path, "third-party/evil"), &mut ctx)
        .unwrap_err();

    assert!(matches!(err, PipelineError::ExtractError { .. }));
    assert!(!root.join("pwned").exists());
}

#[test]
fn existing_link_in_target_is_not_followed() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let outside = root.join("outside");
    fs::create_dir_all(&outside).unwrap();
    fs::create_dir_all(root.join("third-party")).unwrap();
    symlink(&outside, root.join("third-party/escape")).unwrap();
    let path = root.join("downloads/overlay.tar.gz");
    write_tar_gz(&path, &[Entry::File("escape/pwned", b"pwned")]);

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);
    let err = DependencyStager::new(&runner, &secrets)
        .stage(&archive("overlay", &path, "third-party"), &mut ctx)
        .unwrap_err();

    assert!(matches!(err, PipelineError::ExtractError { .. }));
    assert!(!outside.join("pwned").exists());
}

#[test]
fn relative_symlink_inside_the_target_is_kept() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let path = root.join("downloads/runtime.tar.gz");
    write_tar_gz(
        &path,
        &[
            Entry::File("v1/tool", b"tool v1"),
            Entry::Symlink("current", Path::new("v1")),
        ],
    );

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(root);
    let mut ctx = WorkspaceContext::new(root);
    DependencyStager::new(&runner, &secrets)
        .stage(&archive("runtime", &path, "third-party/runtime"), &mut ctx)
        .unwrap();

    assert_eq!(
        fs::read_to_string(root.join("third-party/runtime/current/tool")).unwrap(),
        "tool v1"
    );
}

#[test]
fn git_subpath_is_checked_out_without_touching_the_workspace_repository() {
    let temp = tempdir().unwrap();
    let upstream = temp.path().join("upstream");
    fs::create_dir_all(upstream.join("tests/resources")).unwrap();
    fs::write(upstream.join("tests/resources/clip.mp4"), b"not really a video").unwrap();
    fs::write(upstream.join("README.md"), b"upstream").unwrap();
    git(&upstream, &["init", "--quiet"]);
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "--quiet", "-m", "resources"]);

    let root = temp.path().join("product");
    fs::create_dir_all(&root).unwrap();
    git(&root, &["init", "--quiet"]);

    let dependency = DependencySpec {
        name: "resources".to_string(),
        source: DependencySource::Git(GitSource {
            repository: format!("file://{}", upstream.display()),
            reference: "HEAD".to_string(),
            subpath: "tests/resources".to_string(),
        }),
        target: PathBuf::from("."),
    };

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(&root);
    let mut ctx = WorkspaceContext::new(&root);
    let mut stager = DependencyStager::new(&runner, &secrets);
    let staged = stager.stage(&dependency, &mut ctx).unwrap();

    assert_eq!(staged.kind, "git");
    assert_eq!(staged.files.len(), 1);
    assert_eq!(
        fs::read(root.join("tests/resources/clip.mp4")).unwrap(),
        b"not really a video"
    );
    assert!(!root.join("README.md").exists());
    assert!(!root.join(".release-pipeline-git").exists());
    assert!(!root.join(".git/index").exists());

    stager.stage(&dependency, &mut ctx).unwrap();
    assert_eq!(stager.fetch_count(), 1);
}

#[test]
fn unknown_git_reference_is_a_fetch_error() {
    let temp = tempdir().unwrap();
    let upstream = temp.path().join("upstream");
    fs::create_dir_all(&upstream).unwrap();
    fs::write(upstream.join("file.txt"), b"x").unwrap();
    git(&upstream, &["init", "--quiet"]);
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "--quiet", "-m", "init"]);

    let root = temp.path().join("product");
    fs::create_dir_all(&root).unwrap();
    let dependency = DependencySpec {
        name: "resources".to_string(),
        source: DependencySource::Git(GitSource {
            repository: format!("file://{}", upstream.display()),
            reference: "no-such-branch".to_string(),
            subpath: "file.txt".to_string(),
        }),
        target: PathBuf::from("vendor"),
    };

    let runner = StageRunner::new(MetricsCollector::new());
    let secrets = no_secrets(&root);
    let mut ctx = WorkspaceContext::new(&root);
    let err = DependencyStager::new(&runner, &secrets)
        .stage(&dependency, &mut ctx)
        .unwrap_err();

    assert!(matches!(err, PipelineError::FetchError { .. }));
    assert!(!root.join("vendor/.release-pipeline-git").exists());
}
