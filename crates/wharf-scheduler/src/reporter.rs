//! Narration hook for the scheduler loop and its workers. There's no structured logging
//! dependency in this stack; callers implement [`Reporter`] however suits their deployment
//! (stderr, a channel, a test double that records calls).

use std::sync::{Arc, Mutex};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A [`Reporter`] that writes to stderr, prefixed by level.
#[derive(Default)]
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

pub type SharedReporter = Arc<Mutex<dyn Reporter + Send>>;

pub fn shared(reporter: impl Reporter + Send + 'static) -> SharedReporter {
    Arc::new(Mutex::new(reporter))
}
