//! The scheduler drives a build from creation to a terminal status: it polls a
//! [`wharf_store::BuildStore`] for active builds, claims ready packages, hands each to an
//! [`ExecutorClient`] through an [`wharf_executor::ExecutorPool`], and cascades failures to
//! dependents via [`cascade::cascade_failure`].

mod arch;
mod cancel;
mod cascade;
mod client;
mod reporter;
mod scheduler;
mod semaphore;
mod status;

pub use arch::{host_arch, resolve_arch};
pub use cancel::CancellationToken;
pub use cascade::cascade_failure;
pub use client::{ExecutorClient, ExecutorError, NullExecutorClient, PackageInput, PackageOutput};
pub use reporter::{shared, Reporter, SharedReporter, StderrReporter};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use status::aggregate_status;
