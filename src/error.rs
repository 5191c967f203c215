use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Every way a pipeline run can fail. The first one raised ends the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("provenance mismatch: expected revision {expected}, checked out {actual}")]
    ProvenanceMismatch { expected: String, actual: String },

    #[error("failed to decrypt secret '{reference}': {reason}")]
    DecryptionError { reference: String, reason: String },

    #[error("failed to fetch dependency '{dependency}': {reason}")]
    FetchError { dependency: String, reason: String },

    #[error("failed to extract dependency '{dependency}': {reason}")]
    ExtractError { dependency: String, reason: String },

    #[error("stage '{stage}' failed: command `{command}` exited with {exit_code}")]
    CommandFailure {
        stage: String,
        command: String,
        exit_code: i32,
    },

    #[error("stage '{stage}' exceeded its {timeout_secs}s timeout while running `{command}`")]
    StageTimeout {
        stage: String,
        command: String,
        timeout_secs: u64,
    },

    #[error("declared source is missing: {}", .0.display())]
    MissingSourceError(PathBuf),

    #[error("signing submission failed: {0}")]
    SigningSubmissionError(String),

    #[error("smoke test '{check}' failed: {reason}")]
    SmokeTestFailure { check: String, reason: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable identifier of the failure kind, used in reports and metrics.
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::ProvenanceMismatch { .. } => FailureKind::ProvenanceMismatch,
            PipelineError::DecryptionError { .. } => FailureKind::DecryptionError,
            PipelineError::FetchError { .. } => FailureKind::FetchError,
            PipelineError::ExtractError { .. } => FailureKind::ExtractError,
            PipelineError::CommandFailure { .. } => FailureKind::CommandFailure,
            PipelineError::StageTimeout { .. } => FailureKind::StageTimeout,
            PipelineError::MissingSourceError(_) => FailureKind::MissingSourceError,
            PipelineError::SigningSubmissionError(_) => FailureKind::SigningSubmissionError,
            PipelineError::SmokeTestFailure { .. } => FailureKind::SmokeTestFailure,
            PipelineError::Cancelled => FailureKind::Cancelled,
            PipelineError::InvalidDefinition(_) => FailureKind::InvalidDefinition,
            PipelineError::Io { .. } => FailureKind::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProvenanceMismatch,
    DecryptionError,
    FetchError,
    ExtractError,
    CommandFailure,
    StageTimeout,
    MissingSourceError,
    SigningSubmissionError,
    SmokeTestFailure,
    Cancelled,
    InvalidDefinition,
    Io,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ProvenanceMismatch => "provenance_mismatch",
            FailureKind::DecryptionError => "decryption_error",
            FailureKind::FetchError => "fetch_error",
            FailureKind::ExtractError => "extract_error",
            FailureKind::CommandFailure => "command_failure",
            FailureKind::StageTimeout => "stage_timeout",
            FailureKind::MissingSourceError => "missing_source_error",
            FailureKind::SigningSubmissionError => "signing_submission_error",
            FailureKind::SmokeTestFailure => "smoke_test_failure",
            FailureKind::Cancelled => "cancelled",
            FailureKind::InvalidDefinition => "invalid_definition",
            FailureKind::Io => "io",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
