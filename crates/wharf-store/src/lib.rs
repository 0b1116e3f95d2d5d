//! The build store owns all authoritative [`Build`]/[`PackageJob`] state and exposes the
//! atomic operations the scheduler needs under concurrent access.
//!
//! Two backings are provided: [`InMemoryStore`] (a mutex-guarded map, suitable for a
//! single scheduler instance with no durability requirement) and [`SqlStore`] (rusqlite,
//! for a durable backing). Both satisfy the same [`BuildStore`] contract; callers pick one
//! via the trait object.

mod memory;
mod sql;

pub use memory::{EvictionConfig, InMemoryStore};
pub use sql::SqlStore;

use chrono::Utc;
use wharf_types::{Build, BuildId, BuildSpec, DagNode, PackageJob};

/// Errors raised by a [`BuildStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("build {0} not found")]
    NotFound(String),
    #[error("dependency error: {message}")]
    DependencyError { message: String, cycle: Vec<String> },
    #[error("transient store error: {0}")]
    Transient(#[source] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Owns authoritative build state; all reads and writes to a [`Build`] go through here so
/// concurrent schedulers could in principle coexist (single-instance is the default).
pub trait BuildStore: Send + Sync {
    /// Computes topological order (failing with `DependencyError` on a cycle), allocates a
    /// `bld-` id, and stores a new build with every package `pending` or `blocked`. Returns
    /// a deep copy.
    fn create_build(&self, nodes: Vec<DagNode>, spec: BuildSpec) -> StoreResult<Build>;

    /// Returns a deep copy of the stored build.
    fn get_build(&self, id: &BuildId) -> StoreResult<Build>;

    /// Replaces the stored build's mutable fields. Fails with `NotFound` if absent.
    fn update_build(&self, build: &Build) -> StoreResult<()>;

    /// All builds, sorted by `created_at` ascending.
    fn list_builds(&self) -> StoreResult<Vec<Build>>;

    /// Builds with non-terminal status. Must be cheap; callers poll this.
    fn list_active_builds(&self) -> StoreResult<Vec<Build>>;

    /// Atomically locates one claimable package (status `pending`/`blocked`, every
    /// in-graph dependency `success`), transitions it to `running`, sets `started_at`, and
    /// returns a copy. Returns `Ok(None)` if no package is claimable. Concurrent callers
    /// backed by the same build never observe the same package.
    fn claim_ready_package(&self, build_id: &BuildId) -> StoreResult<Option<PackageJob>>;

    /// Replaces the named package's fields. Fails with `NotFound` if build or package absent.
    fn update_package_job(&self, build_id: &BuildId, pkg: &PackageJob) -> StoreResult<()>;
}

/// Decides whether a package is immediately claimable against its sibling packages: status
/// is `pending`/`blocked`, and every in-graph dependency (a name present among `packages`)
/// has status `success`.
fn is_claimable(pkg: &PackageJob, packages: &[PackageJob]) -> bool {
    if !pkg.status.is_claimable_state() {
        return false;
    }
    pkg.dependencies.iter().all(|dep| match packages.iter().find(|p| &p.name == dep) {
        Some(dep_job) => dep_job.status == wharf_types::PackageStatus::Success,
        // Not an in-graph dependency; ignored per the external-dependency rule.
        None => true,
    })
}

/// Builds the initial package list for a freshly created build: each node's status is
/// `Blocked` if it has any in-graph dependency, else `Pending`.
fn initial_packages(ordered: Vec<DagNode>, graph: &wharf_graph::DependencyGraph) -> Vec<PackageJob> {
    ordered
        .into_iter()
        .map(|node| {
            let in_graph_deps = graph.filter_in_graph(&node.dependencies);
            let mut job = PackageJob::new(node.name, node.config_yaml, node.dependencies);
            job.status = if in_graph_deps.is_empty() {
                wharf_types::PackageStatus::Pending
            } else {
                wharf_types::PackageStatus::Blocked
            };
            job
        })
        .collect()
}

/// Deterministic-enough build id: a counter plus wall-clock nanos hashed with sha2,
/// mirroring the teacher's content-addressed plan id but salted for uniqueness across
/// repeated identical submissions.
fn generate_build_id(nonce: u64, package_names: &[String]) -> BuildId {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(nonce.to_le_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    for name in package_names {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hasher.finalize();
    BuildId::new(hex::encode(&digest[..8]))
}

fn build_graph(nodes: &[DagNode]) -> Result<wharf_graph::DependencyGraph, StoreError> {
    let mut graph = wharf_graph::DependencyGraph::new();
    for node in nodes {
        graph.add_node(node.name.clone(), node.config_yaml.clone(), node.dependencies.iter().cloned()).map_err(
            |e| StoreError::DependencyError { message: e.to_string(), cycle: Vec::new() },
        )?;
    }
    Ok(graph)
}

fn topo_order(graph: &wharf_graph::DependencyGraph) -> Result<Vec<DagNode>, StoreError> {
    graph.topological_sort().map_err(|e| match e {
        wharf_graph::GraphError::Cycle(cycle) => {
            StoreError::DependencyError { message: e.to_string(), cycle }
        }
        wharf_graph::GraphError::DuplicatePackage(name) => {
            StoreError::DependencyError { message: e.to_string(), cycle: vec![name] }
        }
    })
}

#[cfg(test)]
mod contract_tests {
    //! Shared behavioral tests run against every `BuildStore` implementation. Each backing
    //! crate-local test module also calls these via `super::super::contract_tests`.
    use super::*;
    use std::collections::BTreeSet;
    use wharf_types::PackageStatus;

    pub fn nodes_linear_chain() -> Vec<DagNode> {
        vec![
            DagNode::new("a", "name: a\n", vec![]),
            DagNode::new("b", "name: b\n", vec!["a".to_string()]),
            DagNode::new("c", "name: c\n", vec!["b".to_string()]),
        ]
    }

    pub fn nodes_with_cycle() -> Vec<DagNode> {
        vec![
            DagNode::new("x", "name: x\n", vec!["y".to_string()]),
            DagNode::new("y", "name: y\n", vec!["x".to_string()]),
        ]
    }

    pub fn run_create_build_orders_packages_topologically(store: &dyn BuildStore) {
        let build = store.create_build(nodes_linear_chain(), BuildSpec::default()).expect("create");
        let names: Vec<&str> = build.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(build.packages[0].status, PackageStatus::Pending);
        assert_eq!(build.packages[1].status, PackageStatus::Blocked);
    }

    pub fn run_create_build_rejects_cycle(store: &dyn BuildStore) {
        let err = store.create_build(nodes_with_cycle(), BuildSpec::default()).unwrap_err();
        assert!(matches!(err, StoreError::DependencyError { .. }));
        assert!(store.list_builds().expect("list").is_empty());
    }

    pub fn run_claim_ready_package_serializes_single_claim(store: &dyn BuildStore) {
        let build = store.create_build(nodes_linear_chain(), BuildSpec::default()).expect("create");
        let claimed = store.claim_ready_package(&build.id).expect("claim").expect("some job");
        assert_eq!(claimed.name, "a");
        assert_eq!(claimed.status, PackageStatus::Running);

        let second = store.claim_ready_package(&build.id).expect("claim");
        assert!(second.is_none(), "b is blocked on a which has not succeeded yet");
    }

    pub fn run_claim_unblocks_after_dependency_succeeds(store: &dyn BuildStore) {
        let build = store.create_build(nodes_linear_chain(), BuildSpec::default()).expect("create");
        let mut a = store.claim_ready_package(&build.id).expect("claim").expect("a");
        a.status = PackageStatus::Success;
        store.update_package_job(&build.id, &a).expect("update");

        let b = store.claim_ready_package(&build.id).expect("claim").expect("b claimable now");
        assert_eq!(b.name, "b");
    }

    pub fn run_external_dependency_is_immediately_claimable(store: &dyn BuildStore) {
        let nodes = vec![DagNode::new("p", "name: p\n", vec!["busybox".to_string()])];
        let build = store.create_build(nodes, BuildSpec::default()).expect("create");
        assert_eq!(build.packages[0].status, PackageStatus::Pending);
        let claimed = store.claim_ready_package(&build.id).expect("claim").expect("p");
        assert_eq!(claimed.name, "p");
    }

    pub fn run_get_build_returns_deep_copy(store: &dyn BuildStore) {
        let build = store.create_build(nodes_linear_chain(), BuildSpec::default()).expect("create");
        let mut copy = store.get_build(&build.id).expect("get");
        copy.packages.clear();
        let again = store.get_build(&build.id).expect("get again");
        assert_eq!(again.packages.len(), 3);
    }

    pub fn run_update_package_job_requires_existing_build(store: &dyn BuildStore) {
        let missing_id = BuildId::new("does-not-exist");
        let job = PackageJob::new("a", "name: a\n", BTreeSet::new());
        let err = store.update_package_job(&missing_id, &job).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    pub fn run_list_active_builds_excludes_terminal(store: &dyn BuildStore) {
        let build = store.create_build(nodes_linear_chain(), BuildSpec::default()).expect("create");
        assert_eq!(store.list_active_builds().expect("list").len(), 1);

        let mut done = store.get_build(&build.id).expect("get");
        done.status = wharf_types::BuildStatus::Success;
        done.finished_at = Some(Utc::now());
        store.update_build(&done).expect("update");

        assert!(store.list_active_builds().expect("list").is_empty());
    }
}
