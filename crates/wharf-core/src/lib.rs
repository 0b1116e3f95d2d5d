//! Facade over the wharf build-orchestration workspace: submission intake, the unified
//! [`WharfError`] taxonomy, and re-exports of every microcrate so embedders depend on one
//! crate instead of assembling the workspace themselves.
//!
//! ## Modules
//!
//! - [`types`] — shared data model (re-exported from `wharf-types`)
//! - [`graph`] — dependency DAG (re-exported from `wharf-graph`)
//! - [`retry`] — backoff/jitter policy (re-exported from `wharf-retry`)
//! - [`events`] — append-only event log (re-exported from `wharf-events`)
//! - [`store`] — `BuildStore` and its implementations (re-exported from `wharf-store`)
//! - [`executor`] — executor pool and circuit breaker (re-exported from `wharf-executor`)
//! - [`storage`] — `ArtifactStorage` (re-exported from `wharf-storage`)
//! - [`config`] — backend pool configuration loading (re-exported from `wharf-config`)
//! - [`scheduler`] — the control loop (re-exported from `wharf-scheduler`)
//! - [`executor_client`] — the `ExecutorClient` trait, the out-of-scope collaborator
//!   interface (defined in `wharf-scheduler` to avoid a dependency cycle, re-exported here
//!   under the name this facade documents it under; see `DESIGN.md`)
//! - [`intake`] — turns a transport-agnostic submission into a stored build

mod error;
pub mod intake;

pub use error::WharfError;

pub use wharf_types as types;

pub use wharf_graph as graph;

pub use wharf_retry as retry;

pub use wharf_events as events;

pub use wharf_store as store;

pub use wharf_executor as executor;

pub use wharf_storage as storage;

pub use wharf_config as config;

pub use wharf_scheduler as scheduler;

/// The interface the scheduler uses to hand a package off to a BuildKit-backed executor.
/// Defined in `wharf-scheduler` (the scheduler is the only consumer that needs it at
/// compile time); re-exported here under the path this facade's spec documents it under.
pub mod executor_client {
    pub use wharf_scheduler::{ExecutorClient, ExecutorError, NullExecutorClient, PackageInput, PackageOutput};
}
