use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{PipelineError, PipelineResult};

/// Shared flag that tells the in-flight command to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Working tree and process environment owned by a single run.
///
/// Every stage receives this value instead of touching process globals, so
/// search-path extensions made by one stage are seen by the stages after it
/// and by nothing else.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    root: PathBuf,
    path_prepend: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    variables: BTreeMap<String, String>,
    produced: Vec<PathBuf>,
    cancellation: CancellationToken,
}

impl WorkspaceContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut variables = BTreeMap::new();
        variables.insert(
            "workspace".to_string(),
            root.to_string_lossy().to_string(),
        );
        Self {
            root,
            path_prepend: Vec::new(),
            env: BTreeMap::new(),
            variables,
            produced: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// Substitute `{name}` placeholders with workspace variables. Unknown
    /// placeholders are left untouched.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        for (key, value) in &self.variables {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Put `dir` in front of the search path for every later command.
    pub fn prepend_path(&mut self, dir: &Path) {
        let resolved = self.resolve(dir);
        if !self.path_prepend.contains(&resolved) {
            self.path_prepend.insert(0, resolved);
        }
    }

    pub fn path_prepend(&self) -> &[PathBuf] {
        &self.path_prepend
    }

    pub fn record_output(&mut self, path: PathBuf) {
        if !self.produced.contains(&path) {
            self.produced.push(path);
        }
    }

    pub fn produced_outputs(&self) -> &[PathBuf] {
        &self.produced
    }

    /// Environment a command should be spawned with, layered over the
    /// inherited process environment.
    pub fn command_env(&self) -> PipelineResult<Vec<(OsString, OsString)>> {
        let mut vars: Vec<(OsString, OsString)> = self
            .env
            .iter()
            .map(|(key, value)| (OsString::from(key), OsString::from(self.render(value))))
            .collect();

        if !self.path_prepend.is_empty() {
            let inherited = std::env::var_os("PATH").unwrap_or_default();
            let mut entries: Vec<PathBuf> = self.path_prepend.clone();
            entries.extend(std::env::split_paths(&inherited));
            let joined = std::env::join_paths(entries).map_err(|err| {
                PipelineError::InvalidDefinition(format!("invalid search path entry: {err}"))
            })?;
            vars.push((OsString::from("PATH"), joined));
        }

        Ok(vars)
    }

    pub fn ensure_root(&self) -> PipelineResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|err| PipelineError::io(&self.root, err))
    }
}
