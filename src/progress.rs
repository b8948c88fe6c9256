//! Indexing progress reporting.
//!
//! The resource indexer emits a [`ProgressEvent`] after every resource so a
//! UI layer can render "indexing 3 / 8" style status. The CLI writes them
//! to **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an index-update pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// Human-readable task name (usually the resource being processed).
    pub task: String,
    /// Resources finished so far.
    pub done: u64,
    pub total: u64,
}

impl ProgressEvent {
    /// Fraction complete in `[0, 1]`. An empty pass counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Receives progress events from the indexer.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Human-friendly progress on stderr: "indexing  3 / 8  notes.md".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "indexing  {} / {}  ({:.0}%)  {}\n",
            event.done,
            event.total,
            event.fraction() * 100.0,
            event.task
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "task": event.task,
            "done": event.done,
            "total": event.total,
            "fraction": event.fraction(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fraction_bounds() {
        let ev = |done, total| ProgressEvent {
            task: "t".to_string(),
            done,
            total,
        };
        assert_eq!(ev(0, 0).fraction(), 1.0);
        assert_eq!(ev(1, 4).fraction(), 0.25);
        assert_eq!(ev(4, 4).fraction(), 1.0);
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Mutex::new(Vec::new());
        let reporter = |event: ProgressEvent| seen.lock().unwrap().push(event.done);
        reporter.report(ProgressEvent {
            task: "a".to_string(),
            done: 1,
            total: 2,
        });
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
