//! Shared data model for the wharf build-orchestration core.
//!
//! Types in this crate are intentionally free of any storage, scheduling, or execution
//! behavior — they are the nouns the rest of the workspace operates on.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a human-readable string (`"30s"`) or a raw
/// millisecond count, mirroring how backend config and submission payloads may arrive.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds so it round-trips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Opaque build identifier, always rendered with the `bld-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    pub const PREFIX: &'static str = "bld-";

    pub fn new(suffix: impl AsRef<str>) -> Self {
        Self(format!("{}{}", Self::PREFIX, suffix.as_ref()))
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BuildId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Aggregate status of a [`Build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Partial
        )
    }
}

/// Status of a single [`PackageJob`] within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Blocked,
    Running,
    Success,
    Failed,
    Skipped,
}

impl PackageStatus {
    /// `pending` and `blocked` are semantically equivalent for eligibility.
    pub fn is_claimable_state(self) -> bool {
        matches!(self, PackageStatus::Pending | PackageStatus::Blocked)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PackageStatus::Success | PackageStatus::Failed | PackageStatus::Skipped
        )
    }
}

/// Identifies the executor that ran (or is running) a package job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub addr: String,
    pub arch: String,
    pub labels: BTreeMap<String, String>,
}

/// Immutable submission parameters shared by every package in a [`Build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Target architecture override. When absent, the scheduler's host architecture is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default)]
    pub debug: bool,
    /// Label selector (AND-joined) restricting which backends may run this build's packages.
    #[serde(default)]
    pub backend_selector: BTreeMap<String, String>,
    /// Shared pipeline fragments: logical path -> YAML text.
    #[serde(default)]
    pub pipelines: BTreeMap<String, String>,
    /// Per-package source files: package name -> (path -> text).
    #[serde(default)]
    pub source_files: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub with_test: bool,
}

/// A single package's build within a [`Build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageJob {
    pub name: String,
    pub config_yaml: String,
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub pipelines: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub source_files: Option<BTreeMap<String, String>>,
    pub status: PackageStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub backend: Option<BackendRef>,
}

impl PackageJob {
    pub fn new(name: impl Into<String>, config_yaml: impl Into<String>, dependencies: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            config_yaml: config_yaml.into(),
            dependencies,
            pipelines: None,
            source_files: None,
            status: PackageStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            log_path: None,
            output_path: None,
            backend: None,
        }
    }
}

/// The top-level unit of submission: one or more package jobs sharing a dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub status: BuildStatus,
    /// Topological order at creation time. Later mutation never reorders this.
    pub packages: Vec<PackageJob>,
    pub spec: BuildSpec,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn package(&self, name: &str) -> Option<&PackageJob> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut PackageJob> {
        self.packages.iter_mut().find(|p| p.name == name)
    }
}

/// A labeled, architecture-typed backend executor in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub addr: String,
    pub arch: String,
    pub labels: BTreeMap<String, String>,
    pub max_jobs: u32,
    pub active_jobs: u32,
    pub failures: u32,
    pub circuit_open: bool,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
}

impl Backend {
    pub fn new(addr: impl Into<String>, arch: impl Into<String>, max_jobs: u32) -> Self {
        Self {
            addr: addr.into(),
            arch: arch.into(),
            labels: BTreeMap::new(),
            max_jobs,
            active_jobs: 0,
            failures: 0,
            circuit_open: false,
            opened_at: None,
            last_failure: None,
        }
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_jobs == 0 {
            f64::INFINITY
        } else {
            self.active_jobs as f64 / self.max_jobs as f64
        }
    }

    pub fn as_ref_snapshot(&self) -> BackendRef {
        BackendRef {
            addr: self.addr.clone(),
            arch: self.arch.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// A DAG node describing one package's dependencies; used only during graph construction.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    pub config_yaml: String,
    pub dependencies: BTreeSet<String>,
}

impl DagNode {
    pub fn new(
        name: impl Into<String>,
        config_yaml: impl Into<String>,
        dependencies: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            config_yaml: config_yaml.into(),
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

/// §6.1 submission payload (transport-agnostic).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub config_yaml: Option<String>,
    #[serde(default)]
    pub configs: Option<Vec<String>>,
    #[serde(default)]
    pub git_source: Option<GitSource>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, String>,
    #[serde(default)]
    pub source_files: BTreeMap<String, String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub backend_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub with_test: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSource {
    pub repository: String,
    #[serde(default)]
    pub r#ref: Option<String>,
    #[serde(default = "default_git_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
}

fn default_git_pattern() -> String {
    "*.yaml".to_string()
}

/// Response on successful submission creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub id: BuildId,
    pub packages: Vec<String>,
}

/// §6.2 per-package status projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageStatusView {
    pub name: String,
    pub status: PackageStatus,
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub backend: Option<BackendRef>,
}

impl From<&PackageJob> for PackageStatusView {
    fn from(job: &PackageJob) -> Self {
        Self {
            name: job.name.clone(),
            status: job.status,
            dependencies: job.dependencies.clone(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error.clone(),
            log_path: job.log_path.clone(),
            output_path: job.output_path.clone(),
            backend: job.backend.clone(),
        }
    }
}

/// §6.2 build status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusView {
    pub id: BuildId,
    pub status: BuildStatus,
    pub spec: BuildSpec,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub packages: Vec<PackageStatusView>,
}

impl From<&Build> for BuildStatusView {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id.clone(),
            status: build.status,
            spec: build.spec.clone(),
            created_at: build.created_at,
            started_at: build.started_at,
            finished_at: build.finished_at,
            packages: build.packages.iter().map(PackageStatusView::from).collect(),
        }
    }
}

/// Read-only projection of a [`Backend`] for pool observability (§4.3 `status()`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub addr: String,
    pub arch: String,
    pub labels: BTreeMap<String, String>,
    pub max_jobs: u32,
    pub active_jobs: u32,
    pub failures: u32,
    pub circuit_open: bool,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
}

impl From<&Backend> for BackendSnapshot {
    fn from(b: &Backend) -> Self {
        Self {
            addr: b.addr.clone(),
            arch: b.arch.clone(),
            labels: b.labels.clone(),
            max_jobs: b.max_jobs,
            active_jobs: b.active_jobs,
            failures: b.failures,
            circuit_open: b.circuit_open,
            opened_at: b.opened_at,
            last_failure: b.last_failure,
        }
    }
}
