//! Append-only event logging for build orchestration.
//!
//! Provides a JSONL event log for tracking build and package lifecycle transitions,
//! with support for per-build filtering. Separate from the human-facing progress
//! reporting in `wharf-scheduler`'s `Reporter` — this is the machine-readable history.
//!
//! # Example
//!
//! ```
//! use wharf_events::{EventLog, EventType, BuildEvent};
//! use wharf_types::BuildId;
//! use chrono::Utc;
//!
//! let mut log = EventLog::new();
//! let event = BuildEvent {
//!     timestamp: Utc::now(),
//!     build_id: BuildId::new("abc123"),
//!     package: None,
//!     event_type: EventType::BuildSubmitted { package_count: 3 },
//! };
//! log.record(event);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wharf_types::BuildId;

/// Default events file name within a build's state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One lifecycle transition, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    BuildSubmitted { package_count: usize },
    PackageClaimed { backend_addr: String },
    PackageStarted,
    PackageSucceeded { duration_ms: u64 },
    PackageFailed { attempt: u32, message: String },
    PackageCascadedSkip { failed_dependency: String },
    BuildCompleted { status: String },
    ExecutorCircuitOpened { backend_addr: String, consecutive_failures: u32 },
    ExecutorCircuitHalfOpen { backend_addr: String },
    ExecutorCircuitClosed { backend_addr: String },
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub timestamp: DateTime<Utc>,
    pub build_id: BuildId,
    /// `None` for build-wide events (submission, completion, executor state changes).
    pub package: Option<String>,
    pub event_type: EventType,
}

/// Append-only event log for build operations.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BuildEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: BuildEvent) {
        self.events.push(event);
    }

    /// Write all recorded events to a file in JSONL format, appending if it exists.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    /// Read all events from a JSONL file. Missing file is treated as an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path).with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from events file {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: BuildEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_package(&self, package: &str) -> Vec<&BuildEvent> {
        self.events.iter().filter(|e| e.package.as_deref() == Some(package)).collect()
    }

    pub fn events_for_build(&self, build_id: &BuildId) -> Vec<&BuildEvent> {
        self.events.iter().filter(|e| &e.build_id == build_id).collect()
    }

    pub fn all_events(&self) -> &[BuildEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event(build_id: &str, package: Option<&str>) -> BuildEvent {
        BuildEvent {
            timestamp: Utc::now(),
            build_id: BuildId::new(build_id),
            package: package.map(str::to_string),
            event_type: EventType::PackageStarted,
        }
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn record_adds_event_to_log() {
        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_package_filters_correctly() {
        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        log.record(sample_event("b1", Some("pkg-b")));
        log.record(sample_event("b1", Some("pkg-a")));

        assert_eq!(log.events_for_package("pkg-a").len(), 2);
        assert_eq!(log.events_for_package("pkg-b").len(), 1);
    }

    #[test]
    fn events_for_build_filters_correctly() {
        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        log.record(sample_event("b2", Some("pkg-a")));

        assert_eq!(log.events_for_build(&BuildId::new("b1")).len(), 1);
    }

    #[test]
    fn write_to_file_creates_jsonl_format() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        log.write_to_file(&path).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let _: BuildEvent = serde_json::from_str(lines[0]).expect("parse");
    }

    #[test]
    fn write_to_file_appends_to_existing_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log1 = EventLog::new();
        log1.record(sample_event("b1", Some("pkg-a")));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = EventLog::new();
        log2.record(sample_event("b1", Some("pkg-b")));
        log2.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn read_from_file_loads_all_events() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        log.record(sample_event("b1", Some("pkg-b")));
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_from_file_returns_empty_log_when_missing() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nonexistent.jsonl");
        let loaded = EventLog::read_from_file(&path).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn event_types_roundtrip_through_json() {
        let events = vec![
            EventType::BuildSubmitted { package_count: 3 },
            EventType::PackageClaimed { backend_addr: "10.0.0.1:9000".to_string() },
            EventType::PackageStarted,
            EventType::PackageSucceeded { duration_ms: 1200 },
            EventType::PackageFailed { attempt: 2, message: "toolchain timeout".to_string() },
            EventType::PackageCascadedSkip { failed_dependency: "libc".to_string() },
            EventType::BuildCompleted { status: "partial".to_string() },
            EventType::ExecutorCircuitOpened { backend_addr: "10.0.0.2:9000".to_string(), consecutive_failures: 5 },
            EventType::ExecutorCircuitHalfOpen { backend_addr: "10.0.0.2:9000".to_string() },
            EventType::ExecutorCircuitClosed { backend_addr: "10.0.0.2:9000".to_string() },
        ];

        for event_type in events {
            let event = BuildEvent {
                timestamp: Utc::now(),
                build_id: BuildId::new("b1"),
                package: Some("pkg-a".to_string()),
                event_type,
            };
            let json = serde_json::to_string(&event).expect("serialize");
            let parsed: BuildEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn path_helper_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(events_path(&base), PathBuf::from("x").join(EVENTS_FILE));
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.record(sample_event("b1", Some("pkg-a")));
        log.record(sample_event("b1", Some("pkg-b")));
        log.clear();
        assert!(log.is_empty());
    }
}
