//! The control loop: polls the store for active builds, claims ready packages under a
//! bounded semaphore, drives each through an [`ExecutorClient`], and cascades failures.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use wharf_events::{BuildEvent, EventLog, EventType};
use wharf_executor::{CircuitState, ExecutorPool};
use wharf_retry::{RetryExecutor, RetryPolicy};
use wharf_storage::ArtifactStorage;
use wharf_store::BuildStore;
use wharf_types::{Build, BuildId, BuildStatus, PackageJob, PackageStatus};

use crate::arch::resolve_arch;
use crate::cancel::CancellationToken;
use crate::cascade::cascade_failure;
use crate::client::{ExecutorClient, PackageInput};
use crate::reporter::SharedReporter;
use crate::semaphore::Semaphore;
use crate::status::aggregate_status;

/// Tunables for one scheduler run.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub output_dir: PathBuf,
    /// `0` defers to the pool's total capacity, falling back to host CPU count.
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(250), output_dir: PathBuf::from("./wharf-work"), max_parallel: 0 }
    }
}

fn build_status_label(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Pending => "pending",
        BuildStatus::Running => "running",
        BuildStatus::Success => "success",
        BuildStatus::Failed => "failed",
        BuildStatus::Partial => "partial",
    }
}

const JOB_LOG_FILE: &str = "scheduler.log";

fn open_job_log(scratch_dir: &std::path::Path) -> Option<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(scratch_dir.join(JOB_LOG_FILE)).ok()
}

/// Writes `msg` to the reporter and, if present, appends it to the job's log file. The
/// scheduler's only narration channel besides `Reporter` is this per-job file, so every
/// worker-lifecycle line goes through here rather than a bare `eprintln!`.
fn tee(log_file: &mut Option<std::fs::File>, reporter: &SharedReporter, msg: &str) {
    reporter.lock().unwrap().info(msg);
    if let Some(file) = log_file {
        let _ = writeln!(file, "{msg}");
    }
}

fn resolve_max_parallel(configured: usize, pool: &ExecutorPool) -> usize {
    if configured != 0 {
        return configured;
    }
    let capacity = pool.total_capacity();
    if capacity > 0 {
        capacity as usize
    } else {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

struct Inner {
    store: Arc<dyn BuildStore>,
    pool: Arc<ExecutorPool>,
    storage: Arc<dyn ArtifactStorage>,
    executor: Arc<dyn ExecutorClient>,
    events: Option<Arc<Mutex<EventLog>>>,
    reporter: SharedReporter,
    config: SchedulerConfig,
    semaphore: Semaphore,
    processing: Mutex<HashSet<BuildId>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The scheduler ties a [`BuildStore`], an [`ExecutorPool`], an [`ArtifactStorage`], and an
/// [`ExecutorClient`] together into the closed loop described in the module docs. Cloning
/// is cheap; every clone shares the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BuildStore>,
        pool: Arc<ExecutorPool>,
        storage: Arc<dyn ArtifactStorage>,
        executor: Arc<dyn ExecutorClient>,
        reporter: SharedReporter,
        config: SchedulerConfig,
    ) -> Self {
        let max_parallel = resolve_max_parallel(config.max_parallel, &pool);
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                storage,
                executor,
                events: None,
                reporter,
                config,
                semaphore: Semaphore::new(max_parallel),
                processing: Mutex::new(HashSet::new()),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_event_log(mut self, events: Arc<Mutex<EventLog>>) -> Self {
        Arc::get_mut(&mut self.inner).expect("with_event_log must run before run()").events = Some(events);
        self
    }

    /// Runs the control loop until `ctx` is cancelled, then waits for every in-flight
    /// worker to finish before returning.
    pub fn run(&self, ctx: &CancellationToken) {
        while !ctx.is_cancelled() {
            match self.inner.store.list_active_builds() {
                Ok(active) => self.dispatch_unprocessed(active, ctx),
                Err(e) => self.inner.reporter.lock().unwrap().warn(&format!("list_active_builds failed: {e}")),
            }
            self.prune_finished_handles();
            thread::sleep(self.inner.config.poll_interval.min(Duration::from_millis(50)));
            // Re-check cancellation frequently even when poll_interval is long, by
            // sleeping in short slices; good enough for a cooperative loop.
            let mut remaining = self.inner.config.poll_interval.saturating_sub(Duration::from_millis(50));
            while remaining > Duration::ZERO && !ctx.is_cancelled() {
                let slice = remaining.min(Duration::from_millis(50));
                thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }

        let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn dispatch_unprocessed(&self, active: Vec<Build>, ctx: &CancellationToken) {
        for build in active {
            let mut processing = self.inner.processing.lock().unwrap();
            if processing.contains(&build.id) {
                continue;
            }
            processing.insert(build.id.clone());
            drop(processing);

            let scheduler = self.clone();
            let ctx = ctx.clone();
            let build_id = build.id.clone();
            let handle = thread::spawn(move || {
                scheduler.process_build(&build_id, &ctx);
                scheduler.inner.processing.lock().unwrap().remove(&build_id);
            });
            self.inner.handles.lock().unwrap().push(handle);
        }
    }

    fn prune_finished_handles(&self) {
        let mut handles = self.inner.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
    }

    fn process_build(&self, build_id: &BuildId, ctx: &CancellationToken) {
        let Ok(mut build) = self.inner.store.get_build(build_id) else { return };
        if build.status.is_terminal() {
            return;
        }

        if build.status == BuildStatus::Pending {
            build.status = BuildStatus::Running;
            build.started_at = Some(Utc::now());
            if let Err(e) = self.inner.store.update_build(&build) {
                self.inner.reporter.lock().unwrap().warn(&format!("failed to start build {build_id}: {e}"));
                return;
            }
        }

        // Claim loop: keep claiming ready packages under the semaphore until none remain.
        loop {
            if ctx.is_cancelled() {
                break;
            }
            let permit = self.inner.semaphore.acquire();
            match self.inner.store.claim_ready_package(build_id) {
                Ok(Some(job)) => self.spawn_worker(build_id.clone(), build.spec.arch.clone(), job, permit, ctx.clone()),
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(e) => {
                    self.inner.reporter.lock().unwrap().warn(&format!("transient claim error on {build_id}: {e}"));
                    drop(permit);
                    break;
                }
            }
        }

        // One more immediate probe: a worker spawned above may have already finished and
        // unblocked a dependent before we got here.
        if !ctx.is_cancelled() {
            let permit = self.inner.semaphore.acquire();
            match self.inner.store.claim_ready_package(build_id) {
                Ok(Some(job)) => self.spawn_worker(build_id.clone(), build.spec.arch.clone(), job, permit, ctx.clone()),
                _ => drop(permit),
            }
        }

        self.settle_aggregate_status(build_id);
    }

    fn spawn_worker(
        &self,
        build_id: BuildId,
        spec_arch: Option<String>,
        job: PackageJob,
        permit: crate::semaphore::SemaphorePermit,
        ctx: CancellationToken,
    ) {
        let scheduler = self.clone();
        let handle = thread::spawn(move || {
            let _permit = permit;
            scheduler.run_worker(&build_id, spec_arch.as_deref(), job, &ctx);
        });
        self.inner.handles.lock().unwrap().push(handle);
    }

    fn run_worker(&self, build_id: &BuildId, spec_arch: Option<&str>, mut job: PackageJob, ctx: &CancellationToken) {
        let spec = self.inner.store.get_build(build_id).map(|b| b.spec).unwrap_or_default();

        let scratch_dir = self.inner.config.output_dir.join(build_id.to_string()).join(&job.name);
        let dest_dir = scratch_dir.join("output");
        let _ = std::fs::create_dir_all(&dest_dir);
        let mut log_file = open_job_log(&dest_dir);
        job.log_path = Some(dest_dir.join(JOB_LOG_FILE).display().to_string());

        let arch = resolve_arch(spec_arch);
        let storage_id = format!("{build_id}/{}", job.name);
        tee(&mut log_file, &self.inner.reporter, &format!("[{}] starting on arch {arch}", job.name));
        self.log_event(build_id, Some(&job.name), EventType::PackageStarted);

        let backend = match self.inner.pool.select_and_acquire(&arch, &spec.backend_selector) {
            Ok(backend) => backend,
            Err(e) => {
                tee(&mut log_file, &self.inner.reporter, &format!("[{}] {e}", job.name));
                self.fail_and_cascade(build_id, &mut job, e.to_string());
                return;
            }
        };
        job.backend = Some(backend.clone());
        if self.inner.pool.circuit_state(&backend.addr) == Some(CircuitState::HalfOpen) {
            self.log_event(build_id, Some(&job.name), EventType::ExecutorCircuitHalfOpen { backend_addr: backend.addr.clone() });
        }
        tee(&mut log_file, &self.inner.reporter, &format!("[{}] claimed backend {}", job.name, backend.addr));
        self.log_event(build_id, Some(&job.name), EventType::PackageClaimed { backend_addr: backend.addr.clone() });

        let pipelines = job.pipelines.clone().unwrap_or_else(|| spec.pipelines.clone());
        let source_files =
            job.source_files.clone().unwrap_or_else(|| spec.source_files.get(&job.name).cloned().unwrap_or_default());

        let input = PackageInput {
            package_name: job.name.clone(),
            config_yaml: job.config_yaml.clone(),
            pipelines,
            source_files,
            arch,
            debug: spec.debug,
            backend_addr: backend.addr.clone(),
            cache_key: None,
            namespace: build_id.to_string(),
            repository: job.name.clone(),
            dest_dir: dest_dir.clone(),
        };

        let started = std::time::Instant::now();
        let outcome = self.inner.executor.build_package(ctx, &input);

        let success = outcome.is_ok();
        let was_closed = self.inner.pool.circuit_state(&backend.addr) == Some(CircuitState::Closed);
        self.inner.pool.release(&backend.addr, success);
        self.log_circuit_transition(build_id, &job.name, &backend.addr, was_closed);

        let retry = RetryExecutor::from_policy(RetryPolicy::Default);

        match outcome {
            Ok(output) => {
                if let Err(e) = retry.run(|_attempt| self.inner.storage.sync_output_dir(&storage_id, &output.output_dir)) {
                    tee(&mut log_file, &self.inner.reporter, &format!("[{}] storage sync failed: {e}", job.name));
                    self.fail_and_cascade(build_id, &mut job, format!("storage sync failed: {e}"));
                    return;
                }
                job.status = PackageStatus::Success;
                job.output_path = Some(self.inner.storage.output_dir(&storage_id).display().to_string());
                job.log_path = Some(output.log_path.display().to_string());
                job.finished_at = Some(Utc::now());
                let _ = self.inner.store.update_package_job(build_id, &job);
                tee(&mut log_file, &self.inner.reporter, &format!("[{}] succeeded in {:?}", job.name, started.elapsed()));
                self.log_event(
                    build_id,
                    Some(&job.name),
                    EventType::PackageSucceeded { duration_ms: started.elapsed().as_millis() as u64 },
                );
                self.cleanup_scratch_dir(&scratch_dir, &storage_id);
            }
            Err(e) => {
                // Best-effort: sync whatever logs/artifacts exist even on failure.
                let _ = retry.run(|_attempt| self.inner.storage.sync_output_dir(&storage_id, &dest_dir));
                tee(&mut log_file, &self.inner.reporter, &format!("[{}] failed: {}", job.name, e.0));
                self.fail_and_cascade(build_id, &mut job, e.0);
                self.cleanup_scratch_dir(&scratch_dir, &storage_id);
            }
        }
    }

    /// Diffs circuit state around a `release` call and logs the open/close transition, if
    /// any. Half-open probes are logged separately, right after `select_and_acquire`.
    fn log_circuit_transition(&self, build_id: &BuildId, package: &str, addr: &str, was_closed: bool) {
        match self.inner.pool.circuit_state(addr) {
            Some(CircuitState::Open) if was_closed => {
                let failures = self.inner.pool.status().iter().find(|b| b.addr == addr).map(|b| b.failures).unwrap_or(0);
                self.log_event(
                    build_id,
                    Some(package),
                    EventType::ExecutorCircuitOpened { backend_addr: addr.to_string(), consecutive_failures: failures },
                );
            }
            Some(CircuitState::Closed) if !was_closed => {
                self.log_event(build_id, Some(package), EventType::ExecutorCircuitClosed { backend_addr: addr.to_string() });
            }
            _ => {}
        }
    }

    fn fail_and_cascade(&self, build_id: &BuildId, job: &mut PackageJob, message: String) {
        job.status = PackageStatus::Failed;
        job.error = Some(message.clone());
        job.finished_at = Some(Utc::now());
        if self.inner.store.update_package_job(build_id, job).is_err() {
            return;
        }
        self.log_event(build_id, Some(&job.name), EventType::PackageFailed { attempt: 1, message });

        let Ok(mut build) = self.inner.store.get_build(build_id) else { return };
        let skipped = cascade_failure(&mut build, &job.name);
        let _ = self.inner.store.update_build(&build);
        for (name, failed_dependency) in skipped {
            self.log_event(build_id, Some(&name), EventType::PackageCascadedSkip { failed_dependency });
        }
    }

    fn cleanup_scratch_dir(&self, scratch_dir: &std::path::Path, job_id: &str) {
        if scratch_dir != self.inner.storage.output_dir(job_id) {
            let _ = std::fs::remove_dir_all(scratch_dir);
        }
    }

    fn settle_aggregate_status(&self, build_id: &BuildId) {
        let Ok(current) = self.inner.store.get_build(build_id) else { return };
        if current.status.is_terminal() {
            return;
        }

        let statuses: Vec<PackageStatus> = current.packages.iter().map(|p| p.status).collect();
        let aggregate = aggregate_status(&statuses);
        if aggregate == current.status {
            return;
        }

        let mut updated = current;
        updated.status = aggregate;
        if aggregate.is_terminal() {
            updated.finished_at = Some(Utc::now());
        }
        if self.inner.store.update_build(&updated).is_ok() && aggregate.is_terminal() {
            self.log_event(build_id, None, EventType::BuildCompleted { status: build_status_label(aggregate).to_string() });
        }
    }

    fn log_event(&self, build_id: &BuildId, package: Option<&str>, event_type: EventType) {
        let Some(events) = &self.inner.events else { return };
        events.lock().unwrap().record(BuildEvent {
            timestamp: Utc::now(),
            build_id: build_id.clone(),
            package: package.map(str::to_string),
            event_type,
        });
    }
}
