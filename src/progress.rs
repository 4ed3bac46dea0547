//! Pass progress reporting.
//!
//! Reports how far a pass has got (`tickets  1,234 / 5,000 records`) so an
//! operator watching a long import can tell it is alive. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a pass.
#[derive(Clone, Debug)]
pub enum PassProgressEvent {
    /// Loading inputs and target lookups. Total unknown.
    Preparing { pass: String },
    /// `n` records attempted out of `total`.
    Processing { pass: String, n: u64, total: u64 },
}

/// Reports pass progress. Implementations write to stderr (human or JSON).
pub trait PassProgressReporter: Send + Sync {
    fn report(&self, event: PassProgressEvent);
}

/// `tickets  1,234 / 5,000 records (24%)` lines on stderr.
pub struct StderrProgress;

impl PassProgressReporter for StderrProgress {
    fn report(&self, event: PassProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", human_line(&event));
        let _ = err.flush();
    }
}

/// One JSON object per event on stderr, for wrappers that track long imports.
pub struct JsonProgress;

impl PassProgressReporter for JsonProgress {
    fn report(&self, event: PassProgressEvent) {
        if let Ok(line) = serde_json::to_string(&json_event(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl PassProgressReporter for NoProgress {
    fn report(&self, _event: PassProgressEvent) {}
}

fn human_line(event: &PassProgressEvent) -> String {
    match event {
        PassProgressEvent::Preparing { pass } => format!("{}  preparing...", pass),
        PassProgressEvent::Processing { pass, n, total } => format!(
            "{}  {} / {} records ({}%)",
            pass,
            thousands(*n),
            thousands(*total),
            percentage(*n, *total)
        ),
    }
}

fn json_event(event: &PassProgressEvent) -> serde_json::Value {
    match event {
        PassProgressEvent::Preparing { pass } => serde_json::json!({
            "event": "pass_progress",
            "pass": pass,
            "phase": "preparing",
        }),
        PassProgressEvent::Processing { pass, n, total } => serde_json::json!({
            "event": "pass_progress",
            "pass": pass,
            "phase": "processing",
            "attempted": n,
            "records": total,
        }),
    }
}

fn percentage(n: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        (n * 100) / total
    }
}

/// `1234567` → `1,234,567`.
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut groups: Vec<&str> = Vec::new();
    if head > 0 {
        groups.push(&digits[..head]);
    }
    let mut i = head;
    while i < digits.len() {
        groups.push(&digits[i..i + 3]);
        i += 3;
    }
    groups.join(",")
}

/// `--progress` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human when stderr is a terminal, off when it is piped or redirected.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            Self::Human
        } else {
            Self::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn PassProgressReporter> {
        match self {
            Self::Off => Box::new(NoProgress),
            Self::Human => Box::new(StderrProgress),
            Self::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thousands() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(25_000), "25,000");
        assert_eq!(thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn test_percentage_of_empty_pass_is_complete() {
        assert_eq!(percentage(0, 0), 100);
        assert_eq!(percentage(1, 3), 33);
    }

    #[test]
    fn test_human_line() {
        let event = PassProgressEvent::Processing {
            pass: "tickets".into(),
            n: 1234,
            total: 5000,
        };
        assert_eq!(human_line(&event), "tickets  1,234 / 5,000 records (24%)");
    }

    #[test]
    fn test_json_event() {
        let event = PassProgressEvent::Preparing {
            pass: "comments".into(),
        };
        let value = json_event(&event);
        assert_eq!(value["pass"], "comments");
        assert_eq!(value["phase"], "preparing");
        assert!(value.get("records").is_none());
    }
}
