//! A durable [`BuildStore`] backed by SQLite via `rusqlite`.
//!
//! SQLite has no row-level `SELECT ... FOR UPDATE SKIP LOCKED`, so atomicity here comes
//! from a single serialized writer: every operation takes the same `Mutex<Connection>` for
//! its whole transaction. This trades the row-level concurrency a Postgres-backed store
//! would have for the teacher's synchronous-everything idiom and zero extra infrastructure;
//! see `DESIGN.md` for the full tradeoff.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use wharf_types::{BackendRef, Build, BuildId, BuildSpec, BuildStatus, DagNode, PackageJob, PackageStatus};

use crate::{BuildStore, StoreError, StoreResult, build_graph, generate_build_id, initial_packages, is_claimable, topo_order};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS builds (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    spec_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE TABLE IF NOT EXISTS package_jobs (
    build_id TEXT NOT NULL REFERENCES builds(id),
    name TEXT NOT NULL,
    position INTEGER NOT NULL,
    config_yaml TEXT NOT NULL,
    dependencies_json TEXT NOT NULL,
    pipelines_json TEXT,
    source_files_json TEXT,
    status TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    error TEXT,
    log_path TEXT,
    output_path TEXT,
    backend_json TEXT,
    PRIMARY KEY (build_id, name)
);
CREATE INDEX IF NOT EXISTS package_jobs_build_idx ON package_jobs(build_id, position);
";

/// Durable build store. Holds one connection behind a mutex; every call that mutates state
/// runs inside an explicit transaction so a crash mid-write never leaves the two logical
/// tables inconsistent.
pub struct SqlStore {
    conn: Mutex<Connection>,
    nonce: AtomicU64,
}

impl SqlStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn), nonce: AtomicU64::new(0) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn), nonce: AtomicU64::new(0) })
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn status_str(status: PackageStatus) -> &'static str {
    match status {
        PackageStatus::Pending => "pending",
        PackageStatus::Blocked => "blocked",
        PackageStatus::Running => "running",
        PackageStatus::Success => "success",
        PackageStatus::Failed => "failed",
        PackageStatus::Skipped => "skipped",
    }
}

fn parse_status(s: &str) -> PackageStatus {
    match s {
        "pending" => PackageStatus::Pending,
        "blocked" => PackageStatus::Blocked,
        "running" => PackageStatus::Running,
        "success" => PackageStatus::Success,
        "failed" => PackageStatus::Failed,
        "skipped" => PackageStatus::Skipped,
        other => unreachable!("unknown package status persisted: {other}"),
    }
}

fn build_status_str(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Pending => "pending",
        BuildStatus::Running => "running",
        BuildStatus::Success => "success",
        BuildStatus::Failed => "failed",
        BuildStatus::Partial => "partial",
    }
}

fn parse_build_status(s: &str) -> BuildStatus {
    match s {
        "pending" => BuildStatus::Pending,
        "running" => BuildStatus::Running,
        "success" => BuildStatus::Success,
        "failed" => BuildStatus::Failed,
        "partial" => BuildStatus::Partial,
        other => unreachable!("unknown build status persisted: {other}"),
    }
}

fn insert_build_tx(tx: &rusqlite::Transaction, build: &Build) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO builds (id, status, spec_json, created_at, started_at, finished_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            build.id.as_ref(),
            build_status_str(build.status),
            serde_json::to_string(&build.spec).expect("BuildSpec serializes"),
            ts(build.created_at),
            opt_ts(build.started_at),
            opt_ts(build.finished_at),
        ],
    )?;

    for (position, pkg) in build.packages.iter().enumerate() {
        insert_package_tx(tx, build.id.as_ref(), position as i64, pkg)?;
    }
    Ok(())
}

fn insert_package_tx(tx: &rusqlite::Transaction, build_id: &str, position: i64, pkg: &PackageJob) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO package_jobs (build_id, name, position, config_yaml, dependencies_json, pipelines_json, \
         source_files_json, status, started_at, finished_at, error, log_path, output_path, backend_json) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            build_id,
            pkg.name,
            position,
            pkg.config_yaml,
            serde_json::to_string(&pkg.dependencies).unwrap(),
            pkg.pipelines.as_ref().map(|p| serde_json::to_string(p).unwrap()),
            pkg.source_files.as_ref().map(|p| serde_json::to_string(p).unwrap()),
            status_str(pkg.status),
            opt_ts(pkg.started_at),
            opt_ts(pkg.finished_at),
            pkg.error,
            pkg.log_path,
            pkg.output_path,
            pkg.backend.as_ref().map(|b| serde_json::to_string(b).unwrap()),
        ],
    )?;
    Ok(())
}

fn update_package_tx(tx: &rusqlite::Transaction, build_id: &str, pkg: &PackageJob) -> StoreResult<()> {
    let changed = tx
        .execute(
            "UPDATE package_jobs SET status=?1, started_at=?2, finished_at=?3, error=?4, log_path=?5, \
             output_path=?6, backend_json=?7 WHERE build_id=?8 AND name=?9",
            params![
                status_str(pkg.status),
                opt_ts(pkg.started_at),
                opt_ts(pkg.finished_at),
                pkg.error,
                pkg.log_path,
                pkg.output_path,
                pkg.backend.as_ref().map(|b| serde_json::to_string(b).unwrap()),
                build_id,
                pkg.name,
            ],
        )
        .map_err(|e| StoreError::Transient(e.into()))?;

    if changed == 0 {
        return Err(StoreError::NotFound(pkg.name.clone()));
    }
    Ok(())
}

fn load_build_tx(conn: &Connection, id: &str) -> StoreResult<Option<Build>> {
    let row = conn
        .query_row(
            "SELECT status, spec_json, created_at, started_at, finished_at FROM builds WHERE id=?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| StoreError::Transient(e.into()))?;

    let Some((status, spec_json, created_at, started_at, finished_at)) = row else {
        return Ok(None);
    };

    let packages = load_packages_tx(conn, id)?;

    Ok(Some(Build {
        id: BuildId(id.to_string()),
        status: parse_build_status(&status),
        packages,
        spec: serde_json::from_str::<BuildSpec>(&spec_json).map_err(|e| StoreError::Transient(e.into()))?,
        created_at: parse_ts(&created_at).map_err(|e| StoreError::Transient(e.into()))?,
        started_at: parse_opt_ts(started_at).map_err(|e| StoreError::Transient(e.into()))?,
        finished_at: parse_opt_ts(finished_at).map_err(|e| StoreError::Transient(e.into()))?,
    }))
}

fn load_packages_tx(conn: &Connection, build_id: &str) -> StoreResult<Vec<PackageJob>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, config_yaml, dependencies_json, pipelines_json, source_files_json, status, \
             started_at, finished_at, error, log_path, output_path, backend_json FROM package_jobs \
             WHERE build_id=?1 ORDER BY position ASC",
        )
        .map_err(|e| StoreError::Transient(e.into()))?;

    let rows = stmt
        .query_map(params![build_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })
        .map_err(|e| StoreError::Transient(e.into()))?;

    let mut packages = Vec::new();
    for row in rows {
        let (name, config_yaml, deps_json, pipelines_json, source_files_json, status, started_at, finished_at, error, log_path, output_path, backend_json) =
            row.map_err(|e| StoreError::Transient(e.into()))?;

        packages.push(PackageJob {
            name,
            config_yaml,
            dependencies: serde_json::from_str(&deps_json).map_err(|e| StoreError::Transient(e.into()))?,
            pipelines: pipelines_json.map(|s| serde_json::from_str(&s)).transpose().map_err(|e| StoreError::Transient(e.into()))?,
            source_files: source_files_json.map(|s| serde_json::from_str(&s)).transpose().map_err(|e| StoreError::Transient(e.into()))?,
            status: parse_status(&status),
            started_at: parse_opt_ts(started_at).map_err(|e| StoreError::Transient(e.into()))?,
            finished_at: parse_opt_ts(finished_at).map_err(|e| StoreError::Transient(e.into()))?,
            error,
            log_path,
            output_path,
            backend: backend_json.map(|s| serde_json::from_str::<BackendRef>(&s)).transpose().map_err(|e| StoreError::Transient(e.into()))?,
        });
    }
    Ok(packages)
}

impl BuildStore for SqlStore {
    fn create_build(&self, nodes: Vec<DagNode>, spec: BuildSpec) -> StoreResult<Build> {
        let graph = build_graph(&nodes)?;
        let ordered = topo_order(&graph)?;
        let names: Vec<String> = ordered.iter().map(|n| n.name.clone()).collect();
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);

        let build = Build {
            id: generate_build_id(nonce, &names),
            status: BuildStatus::Pending,
            packages: initial_packages(ordered, &graph),
            spec,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| StoreError::Transient(e.into()))?;
        insert_build_tx(&tx, &build).map_err(|e| StoreError::Transient(e.into()))?;
        tx.commit().map_err(|e| StoreError::Transient(e.into()))?;
        Ok(build)
    }

    fn get_build(&self, id: &BuildId) -> StoreResult<Build> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| StoreError::Transient(e.into()))?;
        let build = load_build_tx(&tx, id.as_ref())?;
        build.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update_build(&self, build: &Build) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| StoreError::Transient(e.into()))?;

        let changed = tx
            .execute(
                "UPDATE builds SET status=?1, spec_json=?2, started_at=?3, finished_at=?4 WHERE id=?5",
                params![
                    build_status_str(build.status),
                    serde_json::to_string(&build.spec).map_err(|e| StoreError::Transient(e.into()))?,
                    opt_ts(build.started_at),
                    opt_ts(build.finished_at),
                    build.id.as_ref(),
                ],
            )
            .map_err(|e| StoreError::Transient(e.into()))?;
        if changed == 0 {
            return Err(StoreError::NotFound(build.id.to_string()));
        }

        for pkg in &build.packages {
            update_package_tx(&tx, build.id.as_ref(), pkg)?;
        }

        tx.commit().map_err(|e| StoreError::Transient(e.into()))?;
        Ok(())
    }

    fn list_builds(&self) -> StoreResult<Vec<Build>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM builds ORDER BY created_at ASC").map_err(|e| StoreError::Transient(e.into()))?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Transient(e.into()))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| StoreError::Transient(e.into()))?;
        drop(stmt);

        let mut builds = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(b) = load_build_tx(&conn, &id)? {
                builds.push(b);
            }
        }
        Ok(builds)
    }

    fn list_active_builds(&self) -> StoreResult<Vec<Build>> {
        Ok(self.list_builds()?.into_iter().filter(|b| !b.status.is_terminal()).collect())
    }

    fn claim_ready_package(&self, build_id: &BuildId) -> StoreResult<Option<PackageJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| StoreError::Transient(e.into()))?;

        let packages = load_packages_tx(&tx, build_id.as_ref())?;
        if packages.is_empty() && load_build_tx(&tx, build_id.as_ref())?.is_none() {
            return Err(StoreError::NotFound(build_id.to_string()));
        }

        let Some(job) = packages.iter().find(|p| is_claimable(p, &packages)).cloned() else {
            return Ok(None);
        };

        let mut claimed = job.clone();
        claimed.status = PackageStatus::Running;
        claimed.started_at = Some(Utc::now());
        update_package_tx(&tx, build_id.as_ref(), &claimed)?;

        tx.commit().map_err(|e| StoreError::Transient(e.into()))?;
        Ok(Some(claimed))
    }

    fn update_package_job(&self, build_id: &BuildId, pkg: &PackageJob) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| StoreError::Transient(e.into()))?;
        update_package_tx(&tx, build_id.as_ref(), pkg)?;
        tx.commit().map_err(|e| StoreError::Transient(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests;

    fn store() -> SqlStore {
        SqlStore::open_in_memory().expect("in-memory sqlite store")
    }

    #[test]
    fn create_build_orders_packages_topologically() {
        contract_tests::run_create_build_orders_packages_topologically(&store());
    }

    #[test]
    fn create_build_rejects_cycle() {
        contract_tests::run_create_build_rejects_cycle(&store());
    }

    #[test]
    fn claim_ready_package_serializes_single_claim() {
        contract_tests::run_claim_ready_package_serializes_single_claim(&store());
    }

    #[test]
    fn claim_unblocks_after_dependency_succeeds() {
        contract_tests::run_claim_unblocks_after_dependency_succeeds(&store());
    }

    #[test]
    fn external_dependency_is_immediately_claimable() {
        contract_tests::run_external_dependency_is_immediately_claimable(&store());
    }

    #[test]
    fn get_build_returns_deep_copy() {
        contract_tests::run_get_build_returns_deep_copy(&store());
    }

    #[test]
    fn update_package_job_requires_existing_build() {
        contract_tests::run_update_package_job_requires_existing_build(&store());
    }

    #[test]
    fn list_active_builds_excludes_terminal() {
        contract_tests::run_list_active_builds_excludes_terminal(&store());
    }

    #[test]
    fn concurrent_claims_never_duplicate() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(store());
        let nodes = vec![
            DagNode::new("root", "name: root\n", vec![]),
            DagNode::new("a", "name: a\n", vec!["root".to_string()]),
            DagNode::new("b", "name: b\n", vec!["root".to_string()]),
            DagNode::new("c", "name: c\n", vec!["root".to_string()]),
        ];
        let build = store.create_build(nodes, BuildSpec::default()).expect("create");

        let mut root = store.claim_ready_package(&build.id).expect("claim").expect("root");
        root.status = PackageStatus::Success;
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
    fn persisted_build_survives_reopen_with_file_backing() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("wharf.sqlite3");

        let build_id = {
            let store = SqlStore::open(&path).expect("open");
            let build = store
                .create_build(
                    vec![DagNode::new("a", "name: a\n", vec![])],
                    BuildSpec::default(),
                )
                .expect("create");
            build.id
        };

        let reopened = SqlStore::open(&path).expect("reopen");
        let build = reopened.get_build(&build_id).expect("get");
        assert_eq!(build.packages.len(), 1);
    }
}
