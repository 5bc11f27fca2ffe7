//! Load progress reporting.
//!
//! Reports observable progress during `docsync load` so operators can see
//! how far through the file list a run is and how much is being skipped.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a load run.
#[derive(Clone, Debug)]
pub enum LoadProgressEvent {
    /// Files listed; `total` is what this run will evaluate.
    Listed { total: u64 },
    /// `n` of `total` evaluated so far.
    Loading {
        n: u64,
        total: u64,
        skipped: u64,
        failed: u64,
    },
}

/// Reports load progress. Implementations write to stderr (human or JSON).
pub trait LoadProgressReporter: Send + Sync {
    fn report(&self, event: LoadProgressEvent);
}

/// Human-friendly progress: "load  1,234 / 5,000 files  (skipped 1,000, failed 2)".
pub struct StderrProgress;

impl LoadProgressReporter for StderrProgress {
    fn report(&self, event: LoadProgressEvent) {
        let line = match &event {
            LoadProgressEvent::Listed { total } => {
                format!("load  {} files to evaluate\n", format_number(*total))
            }
            LoadProgressEvent::Loading {
                n,
                total,
                skipped,
                failed,
            } => format!(
                "load  {} / {} files  (skipped {}, failed {})\n",
                format_number(*n),
                format_number(*total),
                format_number(*skipped),
                format_number(*failed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl LoadProgressReporter for JsonProgress {
    fn report(&self, event: LoadProgressEvent) {
        let obj = match &event {
            LoadProgressEvent::Listed { total } => serde_json::json!({
                "event": "progress",
                "phase": "listed",
                "total": total
            }),
            LoadProgressEvent::Loading {
                n,
                total,
                skipped,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "n": n,
                "total": total,
                "skipped": skipped,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl LoadProgressReporter for NoProgress {
    fn report(&self, _event: LoadProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
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

    pub fn reporter(&self) -> Box<dyn LoadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
