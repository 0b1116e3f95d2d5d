use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use wharf_core::config::PoolConfigFile;
use wharf_core::events::EventLog;
use wharf_core::executor_client::NullExecutorClient;
use wharf_core::intake;
use wharf_core::scheduler::{shared, CancellationToken, Scheduler, SchedulerConfig, StderrReporter};
use wharf_core::storage::FilesystemArtifactStorage;
use wharf_core::store::{BuildStore, InMemoryStore, SqlStore};
use wharf_core::types::{BuildId, BuildStatusView, Submission};

#[derive(Parser, Debug)]
#[command(name = "wharf", version)]
#[command(about = "Submit package builds and drive them through the wharf scheduler")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit one or more package configs and run the scheduler until the build finishes.
    Build {
        /// Single package config file (single-config mode).
        #[arg(long, conflicts_with = "configs_dir")]
        config: Option<PathBuf>,

        /// Directory of `*.yaml`/`*.yml` package config files (multi-config mode).
        #[arg(long = "configs-dir", conflicts_with = "config")]
        configs_dir: Option<PathBuf>,

        /// Backend pool configuration file (§6.3 YAML shape).
        #[arg(long)]
        backends: PathBuf,

        /// Target architecture override; defaults to the scheduler host's architecture.
        #[arg(long)]
        arch: Option<String>,

        #[arg(long)]
        debug: bool,

        /// Directory workers write scratch output and artifacts under.
        #[arg(long, default_value = "./wharf-work")]
        output_dir: PathBuf,

        /// SQLite database path for durable state. Omit for an in-memory, single-run store.
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(long, default_value = "250ms")]
        poll_interval: String,

        /// Required: no production ExecutorClient is wired into this CLI (BuildKit
        /// translation is out of scope for this core, per spec). Builds always run
        /// against a placeholder executor that writes a trivial success log.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the status of a previously submitted build. Requires `--db`, since an
    /// in-memory store doesn't survive past the `build` invocation that created it.
    Status {
        #[arg(long)]
        db: PathBuf,

        #[arg(long = "build-id")]
        build_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Commands::Build { config, configs_dir, backends, arch, debug, output_dir, db, poll_interval, dry_run } => {
            run_build(config, configs_dir, backends, arch, debug, output_dir, db, &poll_interval, dry_run)
        }
        Commands::Status { db, build_id } => run_status(&db, &build_id),
    }
}

fn open_store(db: Option<PathBuf>) -> Result<Arc<dyn BuildStore>> {
    match db {
        Some(path) => Ok(Arc::new(SqlStore::open(&path).with_context(|| format!("opening {}", path.display()))?)),
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

fn load_configs(config: Option<PathBuf>, configs_dir: Option<PathBuf>) -> Result<Submission> {
    if let Some(path) = config {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        return Ok(Submission { config_yaml: Some(text), ..Default::default() });
    }

    if let Some(dir) = configs_dir {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")))
            .collect();
        entries.sort();

        let configs: Vec<String> = entries
            .iter()
            .map(|p| std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())))
            .collect::<Result<_>>()?;
        if configs.is_empty() {
            bail!("no *.yaml/*.yml files found under {}", dir.display());
        }
        return Ok(Submission { configs: Some(configs), ..Default::default() });
    }

    bail!("one of --config or --configs-dir is required")
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    config: Option<PathBuf>,
    configs_dir: Option<PathBuf>,
    backends: PathBuf,
    arch: Option<String>,
    debug: bool,
    output_dir: PathBuf,
    db: Option<PathBuf>,
    poll_interval: &str,
    dry_run: bool,
) -> Result<()> {
    if !dry_run {
        bail!("refusing to run without --dry-run: this CLI has no production ExecutorClient wired in");
    }

    let mut submission = load_configs(config, configs_dir)?;
    submission.arch = arch;
    submission.debug = debug;

    let store = open_store(db)?;
    let events = Arc::new(Mutex::new(EventLog::new()));
    let response = intake::submit(&*store, submission, Some(&events)).context("submitting build")?;
    eprintln!("[info] submitted build {} ({} package(s))", response.id, response.packages.len());

    let pool = PoolConfigFile::load(&backends).context("loading backend pool config")?.build_pool().context("building executor pool")?;
    let storage = Arc::new(FilesystemArtifactStorage::new(output_dir.clone()));
    let executor = Arc::new(NullExecutorClient::new());
    let reporter = shared(StderrReporter);

    let config = SchedulerConfig {
        poll_interval: humantime::parse_duration(poll_interval).context("invalid --poll-interval")?,
        output_dir,
        max_parallel: 0,
    };
    let scheduler = Scheduler::new(store.clone(), Arc::new(pool), storage, executor, reporter, config).with_event_log(events);

    let ctx = CancellationToken::new();
    let build_id = response.id.clone();
    let watcher_store = store.clone();
    let watcher_ctx = ctx.clone();
    let watch_interval = Duration::from_millis(50);
    let handle = std::thread::spawn(move || scheduler.run(&watcher_ctx));

    loop {
        let build = watcher_store.get_build(&build_id).context("polling build status")?;
        if build.status.is_terminal() {
            break;
        }
        std::thread::sleep(watch_interval);
    }
    ctx.cancel();
    handle.join().expect("scheduler thread panicked");

    let build = store.get_build(&build_id).context("reading final build status")?;
    println!("{}", serde_json::to_string_pretty(&BuildStatusView::from(&build))?);
    Ok(())
}

fn run_status(db: &PathBuf, build_id: &str) -> Result<()> {
    let store = SqlStore::open(db).with_context(|| format!("opening {}", db.display()))?;
    let build = store.get_build(&BuildId(build_id.to_string())).context("looking up build")?;
    println!("{}", serde_json::to_string_pretty(&BuildStatusView::from(&build))?);
    Ok(())
}
