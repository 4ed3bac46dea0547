//! End-of-run aggregation of warnings and failures.
//!
//! Operators read "12 failures of kind X" rather than twelve separate
//! lines, so both NOK messages and unresolved-reference warnings are
//! grouped by their distinct text and counted.

use std::collections::BTreeMap;

use crate::models::{Warning, WarningKind};

/// Distinct warnings with occurrence counts, sorted by kind and token.
#[derive(Debug, Clone, Default)]
pub struct WarningLog {
    seen: BTreeMap<(WarningKind, String), (Warning, usize)>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence. Returns `true` the first time a warning is seen.
    pub fn record(&mut self, warning: &Warning) -> bool {
        let key = (warning.kind, warning.token.clone());
        match self.seen.get_mut(&key) {
            Some((_, count)) => {
                *count += 1;
                false
            }
            None => {
                self.seen.insert(key, (warning.clone(), 1));
                true
            }
        }
    }

    pub fn distinct(&self) -> usize {
        self.seen.len()
    }

    pub fn total(&self) -> usize {
        self.seen.values().map(|(_, n)| n).sum()
    }

    /// Distinct warning count per kind.
    pub fn by_kind(&self) -> BTreeMap<WarningKind, usize> {
        let mut out = BTreeMap::new();
        for (kind, _) in self.seen.keys() {
            *out.entry(*kind).or_insert(0) += 1;
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Warning, usize)> {
        self.seen.values().map(|(w, n)| (w, *n))
    }
}

/// NOK records grouped by distinct failure message.
#[derive(Debug, Clone, Default)]
pub struct FailureSummary {
    groups: BTreeMap<String, usize>,
    total: usize,
}

impl FailureSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a str>) -> Self {
        let mut summary = Self::new();
        for m in messages {
            summary.add(m);
        }
        summary
    }

    pub fn add(&mut self, message: &str) {
        let key = message.trim();
        let key = if key.is_empty() { "(no message)" } else { key };
        *self.groups.entry(key.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Groups ordered by descending count, then by message.
    pub fn groups(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = self
            .groups
            .iter()
            .map(|(m, n)| (m.as_str(), *n))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out
    }

    /// Render the summary as indented report lines.
    pub fn render(&self) -> Vec<String> {
        self.groups()
            .into_iter()
            .map(|(message, count)| format!("  {:>5}  {}", count, message))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_grouped_by_message() {
        let summary = FailureSummary::from_messages([
            "assignee: cannot be assigned issues",
            "summary: too long",
            "assignee: cannot be assigned issues",
            "  ",
        ]);
        assert_eq!(summary.total(), 4);
        assert_eq!(
            summary.groups(),
            vec![
                ("assignee: cannot be assigned issues", 2),
                ("(no message)", 1),
                ("summary: too long", 1),
            ]
        );
        assert_eq!(summary.render()[0], "      2  assignee: cannot be assigned issues");
    }

    #[test]
    fn test_warning_log_counts_repeats_once() {
        let mut log = WarningLog::new();
        let w = Warning::new(WarningKind::UnknownTicket, "#42");
        assert!(log.record(&w));
        assert!(!log.record(&w));
        assert!(log.record(&Warning::new(WarningKind::UnknownUser, "bob")));
        assert_eq!(log.distinct(), 2);
        assert_eq!(log.total(), 3);
        assert_eq!(log.by_kind().get(&WarningKind::UnknownTicket), Some(&1));
    }
}
