use std::path::Path;
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};

const MIN_ABBREVIATED_LEN: usize = 7;

/// The source revision a run is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvenanceRecord {
    pub revision: String,
}

impl ProvenanceRecord {
    pub fn new(revision: impl Into<String>) -> PipelineResult<Self> {
        let revision = normalize(&revision.into())?;
        if revision.len() < MIN_ABBREVIATED_LEN {
            return Err(PipelineError::InvalidDefinition(format!(
                "pinned revision '{revision}' is shorter than {MIN_ABBREVIATED_LEN} characters"
            )));
        }
        Ok(Self { revision })
    }
}

/// Where the checked-out revision is read from.
#[derive(Debug, Clone)]
pub enum RevisionSource {
    Explicit(String),
    Git,
}

impl RevisionSource {
    /// Prefer an explicit value, then the named environment variable, then git.
    pub fn detect(explicit: Option<String>, env_var: &str) -> Self {
        explicit
            .or_else(|| std::env::var(env_var).ok())
            .filter(|value| !value.trim().is_empty())
            .map(RevisionSource::Explicit)
            .unwrap_or(RevisionSource::Git)
    }

    /// The checked-out revision, or why it could not be determined.
    pub fn actual_revision(&self, workspace: &Path) -> Result<String, String> {
        match self {
            RevisionSource::Explicit(value) => Ok(value.clone()),
            RevisionSource::Git => {
                let output = Command::new("git")
                    .args(["rev-parse", "HEAD"])
                    .current_dir(workspace)
                    .output()
                    .map_err(|err| format!("failed to run git rev-parse: {err}"))?;
                if !output.status.success() {
                    return Err(format!(
                        "git rev-parse HEAD failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
        }
    }
}

pub struct ProvenanceGate;

impl ProvenanceGate {
    /// Read the checked-out revision from `source` and verify it. A revision
    /// that cannot be read is reported as a mismatch.
    pub fn check(
        expected: &ProvenanceRecord,
        source: &RevisionSource,
        workspace: &Path,
    ) -> PipelineResult<String> {
        let actual = source.actual_revision(workspace).map_err(|reason| {
            warn!(%reason, "Unable to determine checked-out revision");
            PipelineError::ProvenanceMismatch {
                expected: expected.revision.clone(),
                actual: format!("unknown ({reason})"),
            }
        })?;
        Self::verify(expected, &actual)?;
        Ok(actual)
    }

    /// Succeeds only when `actual` is the pinned revision. An abbreviated pin
    /// matches any full revision it prefixes.
    pub fn verify(expected: &ProvenanceRecord, actual: &str) -> PipelineResult<()> {
        let mismatch = || PipelineError::ProvenanceMismatch {
            expected: expected.revision.clone(),
            actual: actual.trim().to_string(),
        };
        let actual_normalized = normalize(actual).map_err(|_| mismatch())?;
        debug!(
            expected = %expected.revision,
            actual = %actual_normalized,
            "Comparing revisions"
        );

        if actual_normalized.starts_with(&expected.revision) {
            info!(revision = %actual_normalized, "Provenance verified");
            Ok(())
        } else {
            Err(mismatch())
        }
    }
}

fn normalize(revision: &str) -> PipelineResult<String> {
    let trimmed = revision.trim().to_ascii_lowercase();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PipelineError::InvalidDefinition(format!(
            "revision '{revision}' is not a hexadecimal commit id"
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "cd1d1b6f0e7b2c4a9d8e3f1a2b3c4d5e6f708192";

    #[test]
    fn abbreviated_pin_matches_full_revision() {
        let record = ProvenanceRecord::new("CD1D1B6").unwrap();
        assert!(ProvenanceGate::verify(&record, FULL).is_ok());
    }

    #[test]
    fn different_revision_is_a_mismatch() {
        let record = ProvenanceRecord::new(FULL).unwrap();
        let err = ProvenanceGate::verify(&record, "abc123").unwrap_err();
        assert!(matches!(err, PipelineError::ProvenanceMismatch { .. }));
    }

    #[test]
    fn full_pin_does_not_match_abbreviated_checkout() {
        let record = ProvenanceRecord::new(FULL).unwrap();
        assert!(ProvenanceGate::verify(&record, "cd1d1b6").is_err());
    }

    #[test]
    fn non_hex_checkout_is_a_mismatch() {
        let record = ProvenanceRecord::new("cd1d1b6").unwrap();
        let err = ProvenanceGate::verify(&record, "main").unwrap_err();
        assert!(matches!(err, PipelineError::ProvenanceMismatch { .. }));
    }

    #[test]
    fn unreadable_checkout_is_a_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let record = ProvenanceRecord::new(FULL).unwrap();
        let err = ProvenanceGate::check(&record, &RevisionSource::Git, temp.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ProvenanceMismatch { .. }));
        assert_eq!(err.kind().as_str(), "provenance_mismatch");
    }

    #[test]
    fn check_returns_the_verified_revision() {
        let record = ProvenanceRecord::new("cd1d1b6").unwrap();
        let source = RevisionSource::Explicit(FULL.to_string());
        let actual = ProvenanceGate::check(&record, &source, Path::new(".")).unwrap();
        assert_eq!(actual, FULL);
    }

    #[test]
    fn short_pins_are_rejected() {
        assert!(ProvenanceRecord::new("cd1").is_err());
        assert!(ProvenanceRecord::new("not-a-sha").is_err());
    }
}
