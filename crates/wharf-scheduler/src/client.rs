//! The executor client is the only point where the scheduler talks to the outside world
//! that actually runs a build. The core never implements the wire protocol; it depends
//! only on this trait.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cancel::CancellationToken;

/// Everything an executor needs to build one package.
#[derive(Debug, Clone)]
pub struct PackageInput {
    pub package_name: String,
    pub config_yaml: String,
    pub pipelines: BTreeMap<String, String>,
    pub source_files: BTreeMap<String, String>,
    pub arch: String,
    pub debug: bool,
    pub backend_addr: String,
    pub cache_key: Option<String>,
    pub namespace: String,
    pub repository: String,
    pub dest_dir: PathBuf,
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct PackageOutput {
    pub log_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Opaque per the spec: the scheduler only ever classifies an executor error as "build
/// failed", carrying whatever text the executor produced.
#[derive(Debug, thiserror::Error)]
#[error("build failed: {0}")]
pub struct ExecutorError(pub String);

/// The minimal capability the scheduler needs from an executor backend.
///
/// Idempotence is not required; the scheduler never retries a call. The call is
/// cancellable via `ctx` — implementations should stop promptly once it's cancelled,
/// though the scheduler discards a late result either way.
pub trait ExecutorClient: Send + Sync {
    fn build_package(&self, ctx: &CancellationToken, input: &PackageInput) -> Result<PackageOutput, ExecutorError>;
}

/// A test double standing in for a real executor. Behavior is looked up by package name;
/// packages with no configured outcome succeed trivially.
pub struct NullExecutorClient {
    failures: BTreeMap<String, String>,
}

impl NullExecutorClient {
    pub fn new() -> Self {
        Self { failures: BTreeMap::new() }
    }

    /// Makes `build_package` fail for `package_name` with `message`.
    pub fn fail(mut self, package_name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(package_name.into(), message.into());
        self
    }
}

impl Default for NullExecutorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorClient for NullExecutorClient {
    fn build_package(&self, _ctx: &CancellationToken, input: &PackageInput) -> Result<PackageOutput, ExecutorError> {
        if let Some(message) = self.failures.get(&input.package_name) {
            return Err(ExecutorError(message.clone()));
        }
        let log_path = input.dest_dir.join("build.log");
        let _ = std::fs::create_dir_all(&input.dest_dir);
        let _ = std::fs::write(&log_path, format!("built {}\n", input.package_name));
        Ok(PackageOutput { log_path, output_dir: input.dest_dir.clone() })
    }
}
