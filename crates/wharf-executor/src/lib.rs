//! The executor pool owns the set of backend executors: a typed registry with label/arch
//! selection, per-backend concurrency accounting, and a per-backend circuit breaker.
//!
//! Selection and capacity accounting happen under a single mutex so `select_and_acquire`
//! is atomic end to end — no caller can observe a backend between "eligible" and
//! "reserved".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use wharf_types::{Backend, BackendRef, BackendSnapshot};

/// Tunables for the pool's defaults and circuit breaker.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_max_jobs: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { default_max_jobs: 4, failure_threshold: 3, recovery_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend {0} already registered")]
    AlreadyExists(String),
    #[error("backend {0} not found")]
    NotFound(String),
    #[error("cannot remove the last backend in the pool")]
    LastBackend,
    #[error("no backend matches arch/labels")]
    NoMatch,
    #[error("no backend has available capacity")]
    NoCapacity,
}

pub type PoolResult<T> = Result<T, PoolError>;

struct State {
    backends: Vec<Backend>,
}

/// A typed, label/arch-selectable registry of backend executors with load-aware
/// selection and a per-backend circuit breaker.
pub struct ExecutorPool {
    state: Mutex<State>,
    config: PoolConfig,
}

impl ExecutorPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { state: Mutex::new(State { backends: Vec::new() }), config }
    }

    /// All registered backends, insertion order.
    pub fn list(&self) -> Vec<Backend> {
        self.state.lock().unwrap().backends.clone()
    }

    pub fn architectures(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().backends.iter().map(|b| b.arch.clone()).collect()
    }

    pub fn total_capacity(&self) -> u64 {
        self.state.lock().unwrap().backends.iter().map(|b| b.max_jobs as u64).sum()
    }

    /// Registers a backend with `max_jobs` (falling back to `default_max_jobs` when
    /// `max_jobs` is `None`). Rejects a duplicate `addr`.
    pub fn add_backend(
        &self,
        addr: impl Into<String>,
        arch: impl Into<String>,
        labels: BTreeMap<String, String>,
        max_jobs: Option<u32>,
    ) -> PoolResult<()> {
        let addr = addr.into();
        let mut state = self.state.lock().unwrap();
        if state.backends.iter().any(|b| b.addr == addr) {
            return Err(PoolError::AlreadyExists(addr));
        }
        let mut backend = Backend::new(addr, arch, max_jobs.unwrap_or(self.config.default_max_jobs));
        backend.labels = labels;
        state.backends.push(backend);
        Ok(())
    }

    /// Refuses to remove the last remaining backend. Outstanding `active_jobs` on the
    /// removed backend are permitted; subsequent `release` calls for that `addr` are
    /// silently dropped.
    pub fn remove_backend(&self, addr: &str) -> PoolResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.backends.len() <= 1 {
            return Err(PoolError::LastBackend);
        }
        let before = state.backends.len();
        state.backends.retain(|b| b.addr != addr);
        if state.backends.len() == before {
            return Err(PoolError::NotFound(addr.to_string()));
        }
        Ok(())
    }

    /// Atomically selects an eligible backend and reserves a slot on it. Eligibility, in
    /// order: matching `arch`, every `selector` label present and equal, circuit not open
    /// (or open past `recovery_timeout`, treated as half-open), `active_jobs < max_jobs`.
    /// Among eligible backends the lowest load ratio wins; ties favor insertion order.
    pub fn select_and_acquire(&self, arch: &str, selector: &BTreeMap<String, String>) -> PoolResult<BackendRef> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let matches_arch_and_labels = |b: &Backend| {
            b.arch == arch && selector.iter().all(|(k, v)| b.labels.get(k) == Some(v))
        };
        if !state.backends.iter().any(matches_arch_and_labels) {
            return Err(PoolError::NoMatch);
        }

        let recovery_timeout = chrono::Duration::from_std(self.config.recovery_timeout).unwrap_or(chrono::Duration::zero());
        let circuit_intact = |b: &Backend| {
            !b.circuit_open || b.opened_at.is_some_and(|opened| now >= opened + recovery_timeout)
        };

        let mut best: Option<usize> = None;
        for (i, b) in state.backends.iter().enumerate() {
            if !matches_arch_and_labels(b) || !circuit_intact(b) || b.active_jobs >= b.max_jobs {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => b.load_ratio() < state.backends[j].load_ratio(),
            };
            if better {
                best = Some(i);
            }
        }

        let Some(i) = best else { return Err(PoolError::NoCapacity) };
        let backend = &mut state.backends[i];
        backend.active_jobs += 1;
        Ok(backend.as_ref_snapshot())
    }

    /// Releases a previously acquired slot. A no-op if `addr` was removed from the pool
    /// in the meantime. On success, resets `failures` and closes the circuit (ends a
    /// half-open probe cleanly). On failure, increments `failures`, opening the circuit
    /// once `failures >= failure_threshold`.
    pub fn release(&self, addr: &str, success: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(backend) = state.backends.iter_mut().find(|b| b.addr == addr) else { return };

        backend.active_jobs = backend.active_jobs.saturating_sub(1);
        if success {
            backend.failures = 0;
            backend.circuit_open = false;
            backend.opened_at = None;
        } else {
            backend.failures += 1;
            backend.last_failure = Some(Utc::now());
            if backend.failures >= self.config.failure_threshold {
                backend.circuit_open = true;
                backend.opened_at = Some(Utc::now());
            }
        }
    }

    pub fn status(&self) -> Vec<BackendSnapshot> {
        self.state.lock().unwrap().backends.iter().map(BackendSnapshot::from).collect()
    }

    /// The circuit state of one backend, for callers that want to log breaker transitions
    /// without threading that concern through `select_and_acquire`/`release` themselves.
    /// `None` if `addr` isn't registered.
    pub fn circuit_state(&self, addr: &str) -> Option<CircuitState> {
        let state = self.state.lock().unwrap();
        let backend = state.backends.iter().find(|b| b.addr == addr)?;
        if !backend.circuit_open {
            return Some(CircuitState::Closed);
        }
        let recovery_timeout = chrono::Duration::from_std(self.config.recovery_timeout).unwrap_or(chrono::Duration::zero());
        let half_open = backend.opened_at.is_some_and(|opened| Utc::now() >= opened + recovery_timeout);
        Some(if half_open { CircuitState::HalfOpen } else { CircuitState::Open })
    }
}

/// A backend's circuit-breaker state as observed from outside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Tripped and still within `recovery_timeout`; `select_and_acquire` excludes it.
    Open,
    /// Tripped but past `recovery_timeout`; `select_and_acquire` will let one probe through.
    HalfOpen,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(config: PoolConfig) -> ExecutorPool {
        ExecutorPool::new(config)
    }

    #[test]
    fn add_backend_rejects_duplicate_addr() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), None).expect("first add");
        let err = pool.add_backend("k1", "x86_64", BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, PoolError::AlreadyExists(_)));
    }

    #[test]
    fn remove_backend_refuses_last_remaining() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), None).expect("add");
        let err = pool.remove_backend("k1").unwrap_err();
        assert!(matches!(err, PoolError::LastBackend));
    }

    #[test]
    fn remove_backend_allows_second_to_last() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), None).expect("add");
        pool.add_backend("k2", "x86_64", BTreeMap::new(), None).expect("add");
        pool.remove_backend("k1").expect("remove");
        assert_eq!(pool.list().len(), 1);
    }

    #[test]
    fn select_and_acquire_rejects_arch_mismatch() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "aarch64", BTreeMap::new(), None).expect("add");
        let err = pool.select_and_acquire("x86_64", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PoolError::NoMatch));
    }

    #[test]
    fn select_and_acquire_requires_every_selector_label() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::from([("gpu".to_string(), "true".to_string())]), None).expect("add");

        let mut selector = BTreeMap::new();
        selector.insert("gpu".to_string(), "false".to_string());
        let err = pool.select_and_acquire("x86_64", &selector).unwrap_err();
        assert!(matches!(err, PoolError::NoMatch));

        selector.insert("gpu".to_string(), "true".to_string());
        let backend = pool.select_and_acquire("x86_64", &selector).expect("select");
        assert_eq!(backend.addr, "k1");
    }

    #[test]
    fn select_and_acquire_exhausts_capacity_then_reports_no_capacity() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(1)).expect("add");
        pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("first acquire");
        let err = pool.select_and_acquire("x86_64", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PoolError::NoCapacity));
    }

    #[test]
    fn zero_max_jobs_is_permanently_ineligible() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(0)).expect("add");
        let err = pool.select_and_acquire("x86_64", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PoolError::NoCapacity));
    }

    #[test]
    fn selection_prefers_lowest_load_ratio_ties_favor_insertion_order() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(4)).expect("add");
        pool.add_backend("k2", "x86_64", BTreeMap::new(), Some(2)).expect("add");

        // k1: 0/4 = 0.0, k2: 0/2 = 0.0 -- tie, k1 wins (inserted first).
        let first = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
        assert_eq!(first.addr, "k1");

        // k1: 1/4 = 0.25, k2: 0/2 = 0.0 -- k2 now strictly lower.
        let second = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
        assert_eq!(second.addr, "k2");
    }

    #[test]
    fn release_decrements_active_jobs_and_is_noop_for_removed_backend() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(2)).expect("add");
        pool.add_backend("k2", "x86_64", BTreeMap::new(), Some(2)).expect("add");
        pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
        pool.remove_backend("k1").expect("remove");
        pool.release("k1", true); // no-op, must not panic
        assert_eq!(pool.list().len(), 1);
    }

    #[test]
    fn circuit_opens_after_failure_threshold_and_excludes_backend() {
        let config = PoolConfig { failure_threshold: 2, ..PoolConfig::default() };
        let pool = pool(config);
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(1)).expect("add");
        pool.add_backend("k2", "x86_64", BTreeMap::new(), Some(1)).expect("add");

        for _ in 0..2 {
            let b = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
            let addr = b.addr.clone();
            pool.release(&addr, false);
            if addr == "k2" {
                // settle k2 back to idle for the next iteration
                pool.release(&addr, true);
            }
        }

        let snapshot = pool.status();
        let k1 = snapshot.iter().find(|b| b.addr == "k1").unwrap();
        assert!(k1.circuit_open);
    }

    #[test]
    fn half_open_probe_succeeds_and_closes_circuit() {
        let config = PoolConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(1), ..PoolConfig::default() };
        let pool = pool(config);
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(1)).expect("add");

        let b = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
        pool.release(&b.addr, false);
        assert!(pool.status()[0].circuit_open);

        std::thread::sleep(Duration::from_millis(5));
        let probe = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("half-open probe eligible");
        pool.release(&probe.addr, true);

        let snapshot = pool.status();
        assert!(!snapshot[0].circuit_open);
        assert_eq!(snapshot[0].failures, 0);
    }

    #[test]
    fn half_open_probe_failure_reopens_circuit() {
        let config = PoolConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(1), ..PoolConfig::default() };
        let pool = pool(config);
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(1)).expect("add");

        let b = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("select");
        pool.release(&b.addr, false);
        std::thread::sleep(Duration::from_millis(5));

        let probe = pool.select_and_acquire("x86_64", &BTreeMap::new()).expect("half-open probe eligible");
        pool.release(&probe.addr, false);

        assert!(pool.status()[0].circuit_open);
    }

    #[test]
    fn architectures_and_total_capacity_aggregate_the_registry() {
        let pool = pool(PoolConfig::default());
        pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(4)).expect("add");
        pool.add_backend("k2", "aarch64", BTreeMap::new(), Some(2)).expect("add");
        assert_eq!(pool.architectures(), BTreeSet::from(["x86_64".to_string(), "aarch64".to_string()]));
        assert_eq!(pool.total_capacity(), 6);
    }

    proptest! {
        #[test]
        fn select_and_acquire_never_over_commits(acquires in 0u32..20) {
            let pool = pool(PoolConfig { failure_threshold: 1000, ..PoolConfig::default() });
            pool.add_backend("k1", "x86_64", BTreeMap::new(), Some(3)).expect("add");

            let mut held = 0u32;
            for _ in 0..acquires {
                match pool.select_and_acquire("x86_64", &BTreeMap::new()) {
                    Ok(_) => held += 1,
                    Err(PoolError::NoCapacity) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
                prop_assert!(held <= 3);
            }
        }
    }
}
