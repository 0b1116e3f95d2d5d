//! Mutex-guarded in-memory [`BuildStore`] with optional background eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use wharf_types::{Build, BuildId, BuildSpec, DagNode, PackageJob};

use crate::{BuildStore, StoreError, StoreResult, build_graph, generate_build_id, initial_packages, is_claimable, topo_order};

/// Controls the best-effort background eviction loop. `eviction_interval = Duration::ZERO`
/// disables eviction entirely (no thread is spawned).
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub max_completed_builds: usize,
    pub build_ttl: Duration,
    pub eviction_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self { max_completed_builds: 200, build_ttl: Duration::from_secs(7 * 24 * 3600), eviction_interval: Duration::ZERO }
    }
}

struct Inner {
    builds: Mutex<HashMap<BuildId, Build>>,
    nonce: AtomicU64,
}

/// A single-process build store. Suitable for one scheduler instance with no durability
/// requirement; all state is lost on restart.
pub struct InMemoryStore {
    inner: Arc<Inner>,
    eviction_thread: Option<thread::JoinHandle<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_eviction(EvictionConfig::default())
    }

    pub fn with_eviction(config: EvictionConfig) -> Self {
        let inner = Arc::new(Inner { builds: Mutex::new(HashMap::new()), nonce: AtomicU64::new(0) });

        let eviction_thread = if config.eviction_interval.is_zero() {
            None
        } else {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            Some(thread::spawn(move || eviction_loop(weak, config)))
        };

        Self { inner, eviction_thread }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        // The eviction thread holds only a Weak<Inner>; once Inner drops, its next tick
        // sees the upgrade fail and exits on its own. We don't block shutdown on it.
        if let Some(handle) = self.eviction_thread.take() {
            drop(handle);
        }
    }
}

fn eviction_loop(inner: Weak<Inner>, config: EvictionConfig) {
    loop {
        thread::sleep(config.eviction_interval);
        let Some(inner) = inner.upgrade() else { return };
        let mut builds = inner.builds.lock().unwrap();
        evict_locked(&mut builds, &config);
    }
}

fn evict_locked(builds: &mut HashMap<BuildId, Build>, config: &EvictionConfig) {
    let now = Utc::now();

    let expired: Vec<BuildId> = builds
        .values()
        .filter(|b| b.status.is_terminal())
        .filter(|b| {
            b.finished_at.map(|f| now.signed_duration_since(f).to_std().unwrap_or_default() > config.build_ttl).unwrap_or(false)
        })
        .map(|b| b.id.clone())
        .collect();
    for id in expired {
        builds.remove(&id);
    }

    let mut terminal: Vec<(BuildId, chrono::DateTime<Utc>)> = builds
        .values()
        .filter(|b| b.status.is_terminal())
        .map(|b| (b.id.clone(), b.finished_at.unwrap_or(b.created_at)))
        .collect();
    if terminal.len() > config.max_completed_builds {
        terminal.sort_by_key(|(_, finished_at)| *finished_at);
        let excess = terminal.len() - config.max_completed_builds;
        for (id, _) in terminal.into_iter().take(excess) {
            builds.remove(&id);
        }
    }
}

impl BuildStore for InMemoryStore {
    fn create_build(&self, nodes: Vec<DagNode>, spec: BuildSpec) -> StoreResult<Build> {
        let graph = build_graph(&nodes)?;
        let ordered = topo_order(&graph)?;
        let names: Vec<String> = ordered.iter().map(|n| n.name.clone()).collect();
        let nonce = self.inner.nonce.fetch_add(1, Ordering::Relaxed);

        let build = Build {
            id: generate_build_id(nonce, &names),
            status: wharf_types::BuildStatus::Pending,
            packages: initial_packages(ordered, &graph),
            spec,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let mut builds = self.inner.builds.lock().unwrap();
        builds.insert(build.id.clone(), build.clone());
        Ok(build)
    }

    fn get_build(&self, id: &BuildId) -> StoreResult<Build> {
        let builds = self.inner.builds.lock().unwrap();
        builds.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update_build(&self, build: &Build) -> StoreResult<()> {
        let mut builds = self.inner.builds.lock().unwrap();
        let slot = builds.get_mut(&build.id).ok_or_else(|| StoreError::NotFound(build.id.to_string()))?;
        *slot = build.clone();
        Ok(())
    }

    fn list_builds(&self) -> StoreResult<Vec<Build>> {
        let builds = self.inner.builds.lock().unwrap();
        let mut all: Vec<Build> = builds.values().cloned().collect();
        all.sort_by_key(|b| b.created_at);
        Ok(all)
    }

    fn list_active_builds(&self) -> StoreResult<Vec<Build>> {
        let builds = self.inner.builds.lock().unwrap();
        let mut active: Vec<Build> = builds.values().filter(|b| !b.status.is_terminal()).cloned().collect();
        active.sort_by_key(|b| b.created_at);
        Ok(active)
    }

    fn claim_ready_package(&self, build_id: &BuildId) -> StoreResult<Option<PackageJob>> {
        let mut builds = self.inner.builds.lock().unwrap();
        let build = builds.get_mut(build_id).ok_or_else(|| StoreError::NotFound(build_id.to_string()))?;

        let snapshot = build.packages.clone();
        let Some(job) = build.packages.iter_mut().find(|p| is_claimable(p, &snapshot)) else {
            return Ok(None);
        };

        job.status = wharf_types::PackageStatus::Running;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    fn update_package_job(&self, build_id: &BuildId, pkg: &PackageJob) -> StoreResult<()> {
        let mut builds = self.inner.builds.lock().unwrap();
        let build = builds.get_mut(build_id).ok_or_else(|| StoreError::NotFound(build_id.to_string()))?;
        let slot = build.package_mut(&pkg.name).ok_or_else(|| StoreError::NotFound(pkg.name.clone()))?;
        *slot = pkg.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests;

    #[test]
    fn create_build_orders_packages_topologically() {
        contract_tests::run_create_build_orders_packages_topologically(&InMemoryStore::new());
    }

    #[test]
    fn create_build_rejects_cycle() {
        contract_tests::run_create_build_rejects_cycle(&InMemoryStore::new());
    }

    #[test]
    fn claim_ready_package_serializes_single_claim() {
        contract_tests::run_claim_ready_package_serializes_single_claim(&InMemoryStore::new());
    }

    #[test]
    fn claim_unblocks_after_dependency_succeeds() {
        contract_tests::run_claim_unblocks_after_dependency_succeeds(&InMemoryStore::new());
    }

    #[test]
    fn external_dependency_is_immediately_claimable() {
        contract_tests::run_external_dependency_is_immediately_claimable(&InMemoryStore::new());
    }

    #[test]
    fn get_build_returns_deep_copy() {
        contract_tests::run_get_build_returns_deep_copy(&InMemoryStore::new());
    }

    #[test]
    fn update_package_job_requires_existing_build() {
        contract_tests::run_update_package_job_requires_existing_build(&InMemoryStore::new());
    }

    #[test]
    fn list_active_builds_excludes_terminal() {
        contract_tests::run_list_active_builds_excludes_terminal(&InMemoryStore::new());
    }

    #[test]
    fn concurrent_claims_never_duplicate() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryStore::new());
        let nodes = vec![
            DagNode::new("root", "name: root\n", vec![]),
            DagNode::new("a", "name: a\n", vec!["root".to_string()]),
            DagNode::new("b", "name: b\n", vec!["root".to_string()]),
            DagNode::new("c", "name: c\n", vec!["root".to_string()]),
        ];
        let build = store.create_build(nodes, BuildSpec::default()).expect("create");

        // root must claim+succeed first so a/b/c become claimable together.
        let mut root = store.claim_ready_package(&build.id).expect("claim").expect("root");
        root.status = wharf_types::PackageStatus::Success;
        store.update_package_job(&build.id, &root).expect("update");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = build.id.clone();
                thread::spawn(move || store.claim_ready_package(&id).expect("claim"))
            })
            .collect();

        let mut claimed: Vec<String> = handles.into_iter().filter_map(|h| h.join().unwrap()).map(|j| j.name).collect();
        claimed.sort();
        assert_eq!(claimed, vec!["a", "b", "c"]);
    }

    #[test]
    fn eviction_removes_expired_terminal_builds_but_keeps_active() {
        let mut builds = HashMap::new();
        let mut old_done = Build {
            id: BuildId::new("old"),
            status: wharf_types::BuildStatus::Success,
            packages: vec![],
            spec: BuildSpec::default(),
            created_at: Utc::now() - chrono::Duration::hours(2),
            started_at: None,
            finished_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        old_done.packages.clear();
        let active = Build {
            id: BuildId::new("active"),
            status: wharf_types::BuildStatus::Running,
            packages: vec![],
            spec: BuildSpec::default(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        builds.insert(old_done.id.clone(), old_done);
        builds.insert(active.id.clone(), active.clone());

        let config = EvictionConfig { max_completed_builds: 200, build_ttl: Duration::from_secs(60), eviction_interval: Duration::from_secs(1) };
        evict_locked(&mut builds, &config);

        assert!(!builds.contains_key(&BuildId::new("old")));
        assert!(builds.contains_key(&active.id));
    }

    #[test]
    fn eviction_trims_by_count_when_under_ttl() {
        let mut builds = HashMap::new();
        for i in 0..5 {
            let b = Build {
                id: BuildId::new(format!("b{i}")),
                status: wharf_types::BuildStatus::Success,
                packages: vec![],
                spec: BuildSpec::default(),
                created_at: Utc::now() - chrono::Duration::seconds(10 - i),
                started_at: None,
                finished_at: Some(Utc::now() - chrono::Duration::seconds(10 - i)),
            };
            builds.insert(b.id.clone(), b);
        }

        let config = EvictionConfig { max_completed_builds: 2, build_ttl: Duration::from_secs(3600), eviction_interval: Duration::from_secs(1) };
        evict_locked(&mut builds, &config);

        assert_eq!(builds.len(), 2);
    }
}
