//! Hand-off of unsigned artifacts to an external signing authority.
//!
//! Signing completes out of band. A run only gets as far as
//! [`SigningState::SubmittedForSigning`]; the [`SigningCollector`] picks up
//! finished results later and records them as [`SigningState::Signed`].

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::assembler::{Artifact, write_portable_archive};
use crate::definition::SigningServiceSpec;
use crate::error::{PipelineError, PipelineResult};
use crate::secrets::SecretStore;
use crate::security::compute_sha256;
use crate::toolchain::Toolchain;
use crate::workspace::WorkspaceContext;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNING_DIR: &str = "signing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub id: String,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedArtifact {
    pub handle: SubmissionHandle,
    pub path: PathBuf,
    pub sha256: String,
}

/// Phase one ends the run's responsibility; phase two belongs to the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SigningState {
    SubmittedForSigning(SubmissionHandle),
    Signed(SignedArtifact),
}

impl SigningState {
    pub fn handle(&self) -> &SubmissionHandle {
        match self {
            SigningState::SubmittedForSigning(handle) => handle,
            SigningState::Signed(signed) => &signed.handle,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, SigningState::Signed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedFile {
    pub artifact: String,
    pub file_name: String,
    pub sha256: String,
}

/// Description of one submission unit, authenticated with an HMAC keyed by
/// the signing credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionManifest {
    pub id: String,
    pub product: String,
    pub version: String,
    pub revision: String,
    pub policy: String,
    pub unit_file: String,
    pub unit_sha256: String,
    pub files: Vec<SubmittedFile>,
    pub submitted_at: DateTime<Utc>,
    pub hmac: String,
}

impl SubmissionManifest {
    fn binding_payload(&self) -> String {
        let files = self
            .files
            .iter()
            .map(|file| format!("{}={}", file.file_name, file.sha256))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.id, self.product, self.version, self.revision, self.unit_sha256, files
        )
    }

    /// Constant-time check of the manifest HMAC. A malformed tag is a
    /// mismatch, not an error.
    pub fn verify(&self, token: &SecretString) -> PipelineResult<bool> {
        let Ok(tag) = hex::decode(&self.hmac) else {
            return Ok(false);
        };
        let mut mac = keyed_mac(token)?;
        mac.update(self.binding_payload().as_bytes());
        Ok(mac.verify_slice(&tag).is_ok())
    }
}

fn keyed_mac(token: &SecretString) -> PipelineResult<HmacSha256> {
    HmacSha256::new_from_slice(token.expose_secret().as_bytes()).map_err(|err| {
        PipelineError::SigningSubmissionError(format!("invalid signing credential: {err}"))
    })
}

fn compute_hmac(token: &SecretString, payload: &[u8]) -> PipelineResult<String> {
    let mut mac = keyed_mac(token)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone)]
pub struct SubmissionUnit {
    pub path: PathBuf,
    pub manifest: SubmissionManifest,
}

/// An external signing authority.
pub trait SigningService {
    fn name(&self) -> &str;

    fn submit(
        &self,
        unit: &SubmissionUnit,
        token: &SecretString,
    ) -> PipelineResult<SubmissionHandle>;

    /// Copy the signed result into `destination` if it is ready.
    fn collect(
        &self,
        handle: &SubmissionHandle,
        destination: &Path,
        token: Option<&SecretString>,
    ) -> PipelineResult<Option<PathBuf>>;
}

/// Exchanges submissions through a pair of shared directories.
pub struct DropBoxService {
    outbox: PathBuf,
    inbox: PathBuf,
}

impl DropBoxService {
    pub fn new(outbox: impl Into<PathBuf>, inbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            inbox: inbox.into(),
        }
    }
}

impl SigningService for DropBoxService {
    fn name(&self) -> &str {
        "drop_box"
    }

    fn submit(
        &self,
        unit: &SubmissionUnit,
        _token: &SecretString,
    ) -> PipelineResult<SubmissionHandle> {
        let failure = |err: std::io::Error| {
            PipelineError::SigningSubmissionError(format!(
                "cannot write to outbox {}: {err}",
                self.outbox.display()
            ))
        };
        fs::create_dir_all(&self.outbox).map_err(failure)?;
        let id = &unit.manifest.id;
        fs::copy(&unit.path, self.outbox.join(format!("{id}.tar.gz"))).map_err(failure)?;
        let manifest = serde_json::to_vec_pretty(&unit.manifest)
            .map_err(|err| PipelineError::SigningSubmissionError(err.to_string()))?;
        fs::write(self.outbox.join(format!("{id}.json")), manifest).map_err(failure)?;
        Ok(SubmissionHandle {
            id: id.clone(),
            service: self.name().to_string(),
        })
    }

    fn collect(
        &self,
        handle: &SubmissionHandle,
        destination: &Path,
        _token: Option<&SecretString>,
    ) -> PipelineResult<Option<PathBuf>> {
        let signed = self.inbox.join(format!("{}.tar.gz", handle.id));
        if !signed.is_file() {
            return Ok(None);
        }
        fs::create_dir_all(destination).map_err(|err| PipelineError::io(destination, err))?;
        let target = destination.join(format!("{}-signed.tar.gz", handle.id));
        fs::copy(&signed, &target).map_err(|err| PipelineError::io(&target, err))?;
        Ok(Some(target))
    }
}

/// Submits units to an HTTP endpoint with a bearer credential.
///
/// `POST {endpoint}/submissions` answers with `{"id": ...}`;
/// `GET {endpoint}/submissions/{id}` answers 200 with the signed bytes once
/// ready and 202 or 404 before that.
pub struct HttpSigningService {
    endpoint: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct HttpSubmissionResponse {
    id: String,
}

impl HttpSigningService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl SigningService for HttpSigningService {
    fn name(&self) -> &str {
        "http"
    }

    fn submit(
        &self,
        unit: &SubmissionUnit,
        token: &SecretString,
    ) -> PipelineResult<SubmissionHandle> {
        let failure = |reason: String| PipelineError::SigningSubmissionError(reason);
        let body = fs::read(&unit.path).map_err(|err| failure(err.to_string()))?;
        let manifest = serde_json::to_vec(&unit.manifest).map_err(|err| failure(err.to_string()))?;
        let response: HttpSubmissionResponse = self
            .client
            .post(format!("{}/submissions", self.endpoint))
            .bearer_auth(token.expose_secret())
            .header("X-Signing-Manifest", STANDARD.encode(manifest))
            .header("Content-Type", "application/gzip")
            .body(body)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|err| failure(format!("{}: {err}", self.endpoint)))?;
        Ok(SubmissionHandle {
            id: response.id,
            service: self.name().to_string(),
        })
    }

    fn collect(
        &self,
        handle: &SubmissionHandle,
        destination: &Path,
        token: Option<&SecretString>,
    ) -> PipelineResult<Option<PathBuf>> {
        let failure = |reason: String| PipelineError::SigningSubmissionError(reason);
        let mut request = self
            .client
            .get(format!("{}/submissions/{}", self.endpoint, handle.id));
        if let Some(token) = token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .map_err(|err| failure(format!("{}: {err}", self.endpoint)))?;
        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .and_then(|response| response.bytes())
            .map_err(|err| failure(err.to_string()))?;
        fs::create_dir_all(destination).map_err(|err| PipelineError::io(destination, err))?;
        let target = destination.join(format!("{}-signed.tar.gz", handle.id));
        fs::write(&target, &bytes).map_err(|err| PipelineError::io(&target, err))?;
        Ok(Some(target))
    }
}

pub fn build_service(spec: &SigningServiceSpec, ctx: &WorkspaceContext) -> Box<dyn SigningService> {
    match spec {
        SigningServiceSpec::DropBox { outbox, inbox } => {
            Box::new(DropBoxService::new(ctx.resolve(outbox), ctx.resolve(inbox)))
        }
        SigningServiceSpec::Http { endpoint } => {
            Box::new(HttpSigningService::new(ctx.render(endpoint)))
        }
    }
}

/// One line of the JSON-lines signing ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub recorded_at: DateTime<Utc>,
    pub artifacts: Vec<String>,
    pub unit_sha256: String,
    pub state: SigningState,
}

#[derive(Debug, Clone)]
pub struct SigningLedger {
    path: PathBuf,
}

impl SigningLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LedgerRecord) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| PipelineError::io(&self.path, err))?;
        let line = serde_json::to_string(record)
            .map_err(|err| PipelineError::SigningSubmissionError(err.to_string()))?;
        writeln!(file, "{line}").map_err(|err| PipelineError::io(&self.path, err))
    }

    /// Latest record per submission id, in first-submission order.
    pub fn latest(&self) -> PipelineResult<Vec<LedgerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|err| PipelineError::io(&self.path, err))?;
        let mut order: Vec<String> = Vec::new();
        let mut latest: BTreeMap<String, LedgerRecord> = BTreeMap::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| PipelineError::io(&self.path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(line = index + 1, error = %err, "Skipping unreadable ledger line");
                    continue;
                }
            };
            let id = record.state.handle().id.clone();
            if !latest.contains_key(&id) {
                order.push(id.clone());
            }
            latest.insert(id, record);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}

/// Submission metadata that identifies what is being signed.
#[derive(Debug, Clone)]
pub struct ReleaseIdentity {
    pub product: String,
    pub version: String,
    pub revision: String,
}

pub struct SigningHandoff<'a> {
    secrets: &'a SecretStore,
    service: &'a dyn SigningService,
    toolchain: &'a dyn Toolchain,
    ledger: SigningLedger,
}

impl<'a> SigningHandoff<'a> {
    pub fn new(
        secrets: &'a SecretStore,
        service: &'a dyn SigningService,
        toolchain: &'a dyn Toolchain,
        ledger: SigningLedger,
    ) -> Self {
        Self {
            secrets,
            service,
            toolchain,
            ledger,
        }
    }

    /// Bundle `artifacts` into one unit, authenticate it with `credential`,
    /// submit it and record the submission in the ledger.
    #[instrument(skip_all, fields(service = self.service.name()))]
    pub fn submit(
        &self,
        artifacts: &[&Artifact],
        credential: &str,
        identity: &ReleaseIdentity,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<SigningState> {
        ctx.cancellation().check()?;
        if artifacts.is_empty() {
            return Err(PipelineError::SigningSubmissionError(
                "no artifacts selected for signing".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let unit = self.bundle(&id, artifacts, identity, ctx)?;
        debug!(unit = %unit.path.display(), files = unit.manifest.files.len(), "Submission unit ready");

        let (handle, unit) = self.secrets.with_secret(credential, |token| {
            let mut unit = unit;
            unit.manifest.hmac = compute_hmac(token, unit.manifest.binding_payload().as_bytes())?;
            fs::write(
                unit.path.with_extension("json"),
                serde_json::to_vec_pretty(&unit.manifest)
                    .map_err(|err| PipelineError::SigningSubmissionError(err.to_string()))?,
            )
            .map_err(|err| PipelineError::io(&unit.path, err))?;
            let handle = self.service.submit(&unit, token)?;
            Ok((handle, unit))
        })?;

        let state = SigningState::SubmittedForSigning(handle.clone());
        self.ledger.append(&LedgerRecord {
            recorded_at: Utc::now(),
            artifacts: artifacts.iter().map(|a| a.name.clone()).collect(),
            unit_sha256: unit.manifest.unit_sha256.clone(),
            state: state.clone(),
        })?;

        info!(
            submission = %handle.id,
            ledger = %self.ledger.path().display(),
            "Artifacts submitted for signing"
        );
        Ok(state)
    }

    fn bundle(
        &self,
        id: &str,
        artifacts: &[&Artifact],
        identity: &ReleaseIdentity,
        ctx: &WorkspaceContext,
    ) -> PipelineResult<SubmissionUnit> {
        let staging = ctx.root().join(SIGNING_DIR).join(id);
        fs::create_dir_all(&staging).map_err(|err| PipelineError::io(&staging, err))?;

        let mut files = Vec::with_capacity(artifacts.len());
        let mut sources = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if !artifact.path.is_file() {
                return Err(PipelineError::MissingSourceError(artifact.path.clone()));
            }
            let copy = staging.join(&artifact.file_name);
            fs::copy(&artifact.path, &copy).map_err(|err| PipelineError::io(&copy, err))?;
            files.push(SubmittedFile {
                artifact: artifact.name.clone(),
                file_name: artifact.file_name.clone(),
                sha256: artifact.sha256.clone(),
            });
            sources.push(PathBuf::from(&artifact.file_name));
        }

        let unit_file = format!("{id}.tar.gz");
        let unit_path = ctx.root().join(SIGNING_DIR).join(&unit_file);
        write_portable_archive(&staging, &sources, &unit_path)?;
        let unit_sha256 = compute_sha256(&unit_path).map_err(|err| {
            PipelineError::SigningSubmissionError(format!("cannot hash submission unit: {err}"))
        })?;

        Ok(SubmissionUnit {
            path: unit_path,
            manifest: SubmissionManifest {
                id: id.to_string(),
                product: identity.product.clone(),
                version: identity.version.clone(),
                revision: identity.revision.clone(),
                policy: self.toolchain.signing_policy().to_string(),
                unit_file,
                unit_sha256,
                files,
                submitted_at: Utc::now(),
                hmac: String::new(),
            },
        })
    }
}

/// Second phase of signing: polls the service for every pending submission.
pub struct SigningCollector<'a> {
    service: &'a dyn SigningService,
    ledger: SigningLedger,
    destination: PathBuf,
}

#[derive(Debug, Default, Serialize)]
pub struct CollectionSummary {
    pub signed: Vec<SignedArtifact>,
    pub pending: Vec<SubmissionHandle>,
}

impl<'a> SigningCollector<'a> {
    pub fn new(
        service: &'a dyn SigningService,
        ledger: SigningLedger,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            ledger,
            destination: destination.into(),
        }
    }

    pub fn collect(&self, token: Option<&SecretString>) -> PipelineResult<CollectionSummary> {
        let mut summary = CollectionSummary::default();
        for record in self.ledger.latest()? {
            let SigningState::SubmittedForSigning(handle) = &record.state else {
                continue;
            };
            match self.service.collect(handle, &self.destination, token)? {
                Some(path) => {
                    let sha256 = compute_sha256(&path).map_err(|err| {
                        PipelineError::io(&path, std::io::Error::other(err.to_string()))
                    })?;
                    let signed = SignedArtifact {
                        handle: handle.clone(),
                        path,
                        sha256,
                    };
                    self.ledger.append(&LedgerRecord {
                        recorded_at: Utc::now(),
                        artifacts: record.artifacts.clone(),
                        unit_sha256: record.unit_sha256.clone(),
                        state: SigningState::Signed(signed.clone()),
                    })?;
                    info!(submission = %handle.id, "Signed result collected");
                    summary.signed.push(signed);
                }
                None => {
                    debug!(submission = %handle.id, "Signing still pending");
                    summary.pending.push(handle.clone());
                }
            }
        }
        Ok(summary)
    }
}
