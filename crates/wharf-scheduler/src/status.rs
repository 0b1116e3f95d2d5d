//! Aggregate build status: a pure function over package statuses, so it's tested in
//! isolation from the scheduling loop that calls it.

use wharf_types::{BuildStatus, PackageStatus};

/// Computes the aggregate status for a build from its current package statuses.
///
/// `running` while anything is still in flight or not yet attempted; otherwise `success`
/// if everything succeeded, `partial` if there's a mix of successes and failures, and
/// `failed` for everything else terminal (all-failed, or only failures plus skips with no
/// success at all).
pub fn aggregate_status(packages: &[PackageStatus]) -> BuildStatus {
    let still_active = packages
        .iter()
        .any(|s| matches!(s, PackageStatus::Running | PackageStatus::Pending | PackageStatus::Blocked));
    if still_active {
        return BuildStatus::Running;
    }

    if packages.is_empty() {
        return BuildStatus::Failed;
    }

    let succeeded = packages.iter().any(|s| *s == PackageStatus::Success);
    let failed = packages.iter().any(|s| *s == PackageStatus::Failed);
    let all_succeeded = packages.iter().all(|s| *s == PackageStatus::Success);

    if all_succeeded {
        BuildStatus::Success
    } else if succeeded && failed {
        BuildStatus::Partial
    } else {
        BuildStatus::Failed
    }
}
