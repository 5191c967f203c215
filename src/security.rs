use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: BomMetadata,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BomMetadata {
    timestamp: String,
    tools: Vec<Tool>,
    component: Component,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hashes: Vec<Hash>,
    #[serde(rename = "externalReferences", skip_serializing_if = "Vec::is_empty")]
    external_references: Vec<ExternalReference>,
}

#[derive(Debug, Clone, Serialize)]
struct Hash {
    alg: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ExternalReference {
    #[serde(rename = "type")]
    reference_type: &'static str,
    url: String,
}

/// One entry of a release manifest: a staged dependency or a produced artifact.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: ManifestEntryKind,
    pub locator: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestEntryKind {
    Dependency,
    Artifact,
}

/// Write a CycloneDX-style manifest describing what went into a release.
pub fn write_release_manifest(
    product: &str,
    version: &str,
    entries: &[ManifestEntry],
    output: &Path,
) -> Result<()> {
    let components = entries
        .iter()
        .map(|entry| Component {
            component_type: match entry.kind {
                ManifestEntryKind::Dependency => "library",
                ManifestEntryKind::Artifact => "application",
            },
            name: entry.name.clone(),
            version: match entry.kind {
                ManifestEntryKind::Dependency => None,
                ManifestEntryKind::Artifact => Some(version.to_string()),
            },
            hashes: entry
                .sha256
                .iter()
                .map(|digest| Hash {
                    alg: "SHA-256",
                    content: digest.clone(),
                })
                .collect(),
            external_references: entry
                .locator
                .iter()
                .map(|url| ExternalReference {
                    reference_type: "distribution",
                    url: url.clone(),
                })
                .collect(),
        })
        .collect();

    let bom = Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: BomMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            tools: vec![Tool {
                name: "release-pipeline",
                version: env!("CARGO_PKG_VERSION"),
            }],
            component: Component {
                component_type: "application",
                name: product.to_string(),
                version: Some(version.to_string()),
                hashes: Vec::new(),
                external_references: Vec::new(),
            },
        },
        components,
    };

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create manifest directory: {}", parent.display())
        })?;
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create manifest file: {}", output.display()))?;
    serde_json::to_writer_pretty(file, &bom)
        .with_context(|| format!("Failed to write manifest JSON: {}", output.display()))?;

    Ok(())
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write the SHA256 digest of `path` into the `output` file.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    writeln!(file, "{}  {}", digest, name).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

/// Digest every regular file below `root`, keyed by its `/`-separated
/// relative path. Timestamps and permissions are ignored.
pub fn digest_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    if root.is_file() {
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        digests.insert(name, compute_sha256(root)?);
        return Ok(digests);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to walk directory: {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|part| part.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        digests.insert(relative, compute_sha256(entry.path())?);
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"abc").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_bytes(b"abc"), digest);
    }

    #[test]
    fn digest_sidecar_names_the_file_only() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("portable.tar.gz");
        std::fs::write(&file_path, b"abc").unwrap();
        let sidecar = temp.path().join("out/portable.tar.gz.sha256");
        write_sha256(&file_path, &sidecar).unwrap();

        let contents = std::fs::read_to_string(&sidecar).unwrap();
        assert!(contents.ends_with("  portable.tar.gz\n"));
    }

    #[test]
    fn release_manifest_lists_dependencies_and_artifacts() {
        let temp = tempdir().unwrap();
        let output = temp.path().join("bom.json");
        let entries = vec![
            ManifestEntry {
                name: "ffmpeg".into(),
                kind: ManifestEntryKind::Dependency,
                locator: Some("https://example.invalid/ffmpeg.tar.gz".into()),
                sha256: Some("00ff".into()),
            },
            ManifestEntry {
                name: "portable".into(),
                kind: ManifestEntryKind::Artifact,
                locator: None,
                sha256: Some("abcd".into()),
            },
        ];
        write_release_manifest("scenedetect", "0.6.1", &entries, &output).unwrap();

        let contents = std::fs::read_to_string(&output).unwrap();
        assert!(contents.contains("CycloneDX"));
        assert!(contents.contains("\"ffmpeg\""));
        assert!(contents.contains("\"application\""));
        assert!(contents.contains("SHA-256"));
    }

    #[test]
    fn digest_tree_uses_relative_paths() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/b/c.txt"), b"abc").unwrap();
        std::fs::write(temp.path().join("top.txt"), b"abc").unwrap();

        let digests = digest_tree(temp.path()).unwrap();
        assert_eq!(
            digests.keys().cloned().collect::<Vec<_>>(),
            vec!["a/b/c.txt".to_string(), "top.txt".to_string()]
        );
    }
}
