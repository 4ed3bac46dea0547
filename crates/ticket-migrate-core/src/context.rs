//! Per-run mutable state shared by the rewriter, the resolver and the
//! record creator.
//!
//! A [`RunContext`] lives for exactly one process run. It is threaded
//! explicitly through every component instead of living in globals, so two
//! runs (or two tests) never observe each other's identity blacklists or
//! memoized warnings.

use std::collections::{HashMap, HashSet};

use crate::models::{Warning, WarningKind};
use crate::report::WarningLog;

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Account substituted for reporters and assignees the target rejects.
    pub fallback_account_id: String,
    /// Reporters the target refused as "not a user"; replaced up front.
    pub invalid_reporters: HashSet<String>,
    /// Assignees the target refused as "cannot be assigned issues".
    pub unassignable: HashSet<String>,
    /// Accounts known to be inactive before the run started.
    pub inactive_users: HashSet<String>,
    /// Watchers whose first add failed; never retried.
    pub ignored_watchers: HashSet<String>,
    pub warnings: WarningLog,
    unresolved: HashMap<(WarningKind, String), (String, Warning)>,
}

impl RunContext {
    pub fn new(fallback_account_id: impl Into<String>) -> Self {
        Self {
            fallback_account_id: fallback_account_id.into(),
            ..Self::default()
        }
    }

    /// Memoize the rendering of an unresolved token and return the
    /// warning to report for it. The first rendering wins.
    pub fn memoize(&mut self, kind: WarningKind, token: &str, rendered: String) -> (String, Warning) {
        let entry = self
            .unresolved
            .entry((kind, token.to_string()))
            .or_insert_with(|| (rendered, Warning::new(kind, token)));
        entry.clone()
    }

    /// Add warnings returned by a rewrite to the run log.
    pub fn record_warnings(&mut self, warnings: &[Warning]) {
        for w in warnings {
            if self.warnings.record(w) {
                tracing::warn!(kind = w.kind.as_str(), token = %w.token, "{}", w.message);
            }
        }
    }

    /// Reporter to submit for `account`, substituting the fallback for
    /// identities already known to be rejected.
    pub fn effective_reporter(&self, account: &str) -> String {
        if self.invalid_reporters.contains(account) || self.inactive_users.contains(account) {
            self.fallback_account_id.clone()
        } else {
            account.to_string()
        }
    }

    pub fn effective_assignee(&self, account: &str) -> String {
        if self.unassignable.contains(account) || self.inactive_users.contains(account) {
            self.fallback_account_id.clone()
        } else {
            account.to_string()
        }
    }
}
