//! Turns a transport-agnostic [`Submission`] (§6.1) into a stored [`Build`][wharf_types::Build].
//!
//! The package configuration language itself is out of scope for this core — `config_yaml`
//! is opaque past its `name` and `dependencies` keys, which is the minimum the dependency
//! graph needs. Everything else in a config is forwarded untouched to the executor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use wharf_events::{BuildEvent, EventLog, EventType};
use wharf_store::BuildStore;
use wharf_types::{BuildSpec, DagNode, SubmissionResponse};

use crate::WharfError;

#[derive(Deserialize)]
struct ConfigHeader {
    name: String,
    #[serde(default)]
    dependencies: BTreeSet<String>,
}

fn parse_node(index: usize, config_yaml: &str) -> Result<DagNode, WharfError> {
    let header: ConfigHeader = serde_yaml::from_str(config_yaml)
        .map_err(|e| WharfError::InvalidRequest(format!("package config #{index}: {e}")))?;
    if header.name.trim().is_empty() {
        return Err(WharfError::InvalidRequest(format!("package config #{index}: empty name")));
    }
    Ok(DagNode::new(header.name, config_yaml.to_string(), header.dependencies))
}

/// Validates and stores a submission, returning the accepted build's id and package names
/// in build (topological) order.
///
/// Single-config mode (`config_yaml`) and multi-config mode (`configs`) are both supported.
/// `git_source` is rejected: cloning a git repository is explicitly out of scope for this
/// core (see `spec.md` §1's "Explicitly out of scope" list) — submitters are expected to
/// resolve it to `configs` upstream.
///
/// `events`, when given, records a `BuildSubmitted` event for the accepted build. Pass the
/// same log a [`Scheduler`][wharf_scheduler::Scheduler] is wired to so intake and execution
/// share one audit trail.
pub fn submit(
    store: &dyn BuildStore,
    submission: wharf_types::Submission,
    events: Option<&Arc<Mutex<EventLog>>>,
) -> Result<SubmissionResponse, WharfError> {
    if submission.git_source.is_some() {
        return Err(WharfError::InvalidRequest(
            "git_source submissions are not supported; resolve to `configs` before submitting".to_string(),
        ));
    }

    let raw_configs: Vec<String> = match (submission.config_yaml, submission.configs) {
        (Some(_), Some(_)) => {
            return Err(WharfError::InvalidRequest("specify either config_yaml or configs, not both".to_string()));
        }
        (Some(single), None) => vec![single],
        (None, Some(many)) => many,
        (None, None) => return Err(WharfError::InvalidRequest("one of config_yaml or configs is required".to_string())),
    };

    if raw_configs.is_empty() {
        return Err(WharfError::InvalidRequest("at least one package configuration is required".to_string()));
    }

    let nodes: Vec<DagNode> =
        raw_configs.iter().enumerate().map(|(i, cfg)| parse_node(i, cfg)).collect::<Result<_, _>>()?;

    let mut seen = BTreeSet::new();
    for node in &nodes {
        if !seen.insert(node.name.clone()) {
            return Err(WharfError::InvalidRequest(format!("duplicate package name: {}", node.name)));
        }
    }

    let source_files: BTreeMap<String, BTreeMap<String, String>> = if nodes.len() == 1 && !submission.source_files.is_empty() {
        BTreeMap::from([(nodes[0].name.clone(), submission.source_files.clone())])
    } else {
        BTreeMap::new()
    };

    let spec = BuildSpec {
        arch: submission.arch,
        debug: submission.debug,
        backend_selector: submission.backend_selector,
        pipelines: submission.pipelines,
        source_files,
        with_test: submission.with_test,
    };

    let build = store.create_build(nodes, spec)?;
    if let Some(events) = events {
        events.lock().unwrap().record(BuildEvent {
            timestamp: Utc::now(),
            build_id: build.id.clone(),
            package: None,
            event_type: EventType::BuildSubmitted { package_count: build.packages.len() },
        });
    }
    Ok(SubmissionResponse { id: build.id, packages: build.packages.into_iter().map(|p| p.name).collect() })
}
