//! Cascade: when a package fails, every pending/blocked package whose in-graph
//! dependencies chain back to it is transitioned to `skipped`, recursively, so transitive
//! dependents are covered too.

use wharf_types::{Build, PackageStatus};

/// Walks `build`'s packages looking for ones depending (directly) on `failed_name`, marks
/// them `skipped`, and recurses on each newly skipped name so the whole dependent subtree
/// is covered. External dependencies are never matched since they aren't package names in
/// this build. Returns `(skipped_name, failed_dependency_name)` pairs in skip order, for
/// callers that want to log one event per skip.
pub fn cascade_failure(build: &mut Build, failed_name: &str) -> Vec<(String, String)> {
    let mut to_skip = vec![failed_name.to_string()];
    let mut skipped = Vec::new();

    while let Some(name) = to_skip.pop() {
        let newly_skipped: Vec<String> = build
            .packages
            .iter()
            .filter(|p| p.status.is_claimable_state() && p.dependencies.contains(&name))
            .map(|p| p.name.clone())
            .collect();

        for dependent in newly_skipped {
            if let Some(job) = build.package_mut(&dependent) {
                job.status = PackageStatus::Skipped;
                job.error = Some(format!("dependency {name} failed"));
                job.finished_at = job.finished_at.or(Some(chrono::Utc::now()));
            }
            skipped.push((dependent.clone(), name.clone()));
            to_skip.push(dependent);
        }
    }

    skipped
}
