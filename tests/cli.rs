use std::fs;
use std::path::Path;

use assert_cmd::Command;
use release_pipeline::secrets::open;
use tempfile::tempdir;

const PLACEHOLDER_REVISION: &str = "0000000000000000000000000000000000000000";

fn cli() -> Command {
    let mut command = Command::cargo_bin("release-pipeline").expect("binary present");
    command
        .env_remove("PIPELINE_REVISION")
        .env_remove("PIPELINE_SECRET_KEY")
        .env_remove("PIPELINE_SECRET_SALT");
    command
}

fn init(dir: &Path, template: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{template}.yaml"));
    cli()
        .args(["init", "--template", template, "--output"])
        .arg(&path)
        .assert()
        .success();
    path
}

#[test]
fn init_then_validate_succeeds() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "windows-installer");
    assert!(definition.is_file());

    cli().arg("validate").arg(&definition).assert().success();
}

#[test]
fn init_rejects_unknown_template() {
    let temp = tempdir().unwrap();
    cli()
        .current_dir(temp.path())
        .args(["init", "--template", "bogus"])
        .assert()
        .failure();
    assert!(!temp.path().join("bogus.yaml").exists());
}

#[test]
fn validate_reports_invalid_definition() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "minimal");
    let contents = fs::read_to_string(&definition)
        .unwrap()
        .replace(PLACEHOLDER_REVISION, "abc");
    fs::write(&definition, contents).unwrap();

    cli().arg("validate").arg(&definition).assert().failure();
}

#[test]
fn list_toolchains_names_platforms() {
    let output = cli().arg("list-toolchains").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.contains("windows-x64"));
    assert!(stdout.contains("linux-x64"));
}

#[test]
fn completions_are_generated() {
    let output = cli().args(["completions", "bash"]).assert().success();
    assert!(!output.get_output().stdout.is_empty());
}

#[test]
fn sealed_secret_opens_with_the_same_inputs() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("token.txt");
    let blob = temp.path().join("secrets/signing-token.enc");
    fs::write(&input, "token-abc").unwrap();

    cli()
        .env("PIPELINE_SECRET_KEY", "cli-key")
        .env("PIPELINE_SECRET_SALT", "cli-salt")
        .args(["secrets", "seal", "--reference", "signing-token", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(&blob)
        .assert()
        .success();

    let encoded = fs::read_to_string(&blob).unwrap();
    assert!(!encoded.contains("token-abc"));
    let plaintext = open(b"cli-key", b"cli-salt", "signing-token", &encoded).unwrap();
    assert_eq!(plaintext.as_slice(), b"token-abc");
    assert!(open(b"cli-key", b"cli-salt", "other-ref", &encoded).is_err());
}

#[test]
fn seal_without_key_fails() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("token.txt");
    fs::write(&input, "token-abc").unwrap();

    cli()
        .args(["secrets", "seal", "--reference", "signing-token", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(temp.path().join("out.enc"))
        .assert()
        .failure();
    assert!(!temp.path().join("out.enc").exists());
}

#[test]
fn lock_then_check_detects_drift() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "windows-installer");
    let lockfile = temp.path().join("pipeline.lock");

    cli().arg("lock").arg(&definition).assert().success();
    assert!(lockfile.is_file());
    cli()
        .arg("lock")
        .arg(&definition)
        .arg("--check")
        .assert()
        .success();

    let contents = fs::read_to_string(&definition)
        .unwrap()
        .replace(PLACEHOLDER_REVISION, "1111111111111111111111111111111111111111");
    fs::write(&definition, contents).unwrap();
    cli()
        .arg("lock")
        .arg(&definition)
        .arg("--check")
        .assert()
        .failure();
}

#[test]
fn security_digest_prints_and_writes_sha256() {
    let temp = tempdir().unwrap();
    let file = temp.path().join("payload.bin");
    let sidecar = temp.path().join("payload.bin.sha256");
    fs::write(&file, b"abc").unwrap();

    let output = cli()
        .args(["security", "digest", "--path"])
        .arg(&file)
        .arg("--output")
        .arg(&sidecar)
        .assert()
        .success();
    let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.starts_with(expected));
    assert!(fs::read_to_string(&sidecar).unwrap().contains(expected));
}

#[test]
fn security_manifest_lists_pinned_dependencies() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "windows-installer");
    let manifest = temp.path().join("sbom/manifest.json");

    cli()
        .args(["security", "manifest"])
        .arg(&definition)
        .arg("--output")
        .arg(&manifest)
        .assert()
        .success();

    let contents = fs::read_to_string(&manifest).unwrap();
    assert!(contents.contains("ffmpeg"));
    assert!(contents.contains("mkvtoolnix"));
}

#[test]
fn run_with_mismatched_revision_exits_nonzero_and_writes_report() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "minimal");

    cli()
        .arg("run")
        .arg(&definition)
        .args(["--revision", "1111111111111111111111111111111111111111"])
        .assert()
        .failure();

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("run-report.json")).unwrap())
            .unwrap();
    assert_eq!(report["state"], "failed");
    assert_eq!(report["failure"]["kind"], "provenance_mismatch");
    assert_eq!(report["failure"]["during"], "verifying");
    assert!(!temp.path().join("out").exists());
}

#[cfg(unix)]
#[test]
fn run_minimal_template_succeeds_and_publishes_manifest() {
    let temp = tempdir().unwrap();
    let definition = init(temp.path(), "minimal");
    let metrics = temp.path().join("metrics.prom");

    cli()
        .arg("run")
        .arg(&definition)
        .args(["--revision", PLACEHOLDER_REVISION])
        .arg("--metrics-prometheus")
        .arg(&metrics)
        .assert()
        .success();

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("run-report.json")).unwrap())
            .unwrap();
    assert_eq!(report["state"], "succeeded");
    assert!(temp.path().join("out/0.1.0/manifest.json").is_file());
    assert!(temp.path().join("out/0.1.0/bom.json").is_file());
    assert!(metrics.is_file());
}
