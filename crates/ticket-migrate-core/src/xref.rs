//! Cross-batch reference resolution for already-migrated content.
//!
//! Runs after every batch finished creating records. Content is scanned
//! for three source URL shapes, each naming a space:
//!
//! ```text
//! https://app.assembla.com/spaces/<space>/tickets/<n>?comment=<id>#comment:<id>   comment
//! https://app.assembla.com/spaces/<space>/tickets/<n>-some-title                  ticket
//! https://app.assembla.com/spaces/<space>/git/commits/<hash>                      commit
//! ```
//!
//! The comment pattern is applied first because every comment URL also
//! matches the ticket pattern. Ticket and comment links resolve through the
//! [`GlobalIdMap`]; commit links resolve through the [`RepoTable`] only.
//! A miss leaves that occurrence's text untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;
use serde::Serialize;

use crate::idmap::{GlobalIdMap, MapKind, SpaceResolver};
use crate::models::{Warning, WarningKind};
use crate::segment;

pub const TICKET_KEY_PLACEHOLDER: &str = "[:jira-ticket-key]";
pub const COMMENT_ID_PLACEHOLDER: &str = "[:jira-comment-id]";
pub const REPO_NAME_PLACEHOLDER: &str = "[[REPO-NAME]]";

/// Browse URL templates for the target tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkTemplates {
    pub base_url: String,
    pub browse_issue: String,
    pub browse_comment: String,
}

impl LinkTemplates {
    pub fn new(
        base_url: impl Into<String>,
        browse_issue: impl Into<String>,
        browse_comment: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            browse_issue: browse_issue.into(),
            browse_comment: browse_comment.into(),
        }
    }

    pub fn issue_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            self.browse_issue.replace(TICKET_KEY_PLACEHOLDER, key)
        )
    }

    pub fn comment_url(&self, key: &str, comment_id: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            self.browse_comment
                .replace(TICKET_KEY_PLACEHOLDER, key)
                .replace(COMMENT_ID_PLACEHOLDER, comment_id)
        )
    }
}

/// Source repository → target repository name translation.
///
/// One target may be registered under several source aliases (repository
/// name, space key, repository URL). Registering a different target for an
/// existing alias is rejected.
#[derive(Debug, Clone, Default)]
pub struct RepoTable {
    entries: HashMap<String, String>,
}

impl RepoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) -> Result<(), String> {
        let from = from.into();
        let to = to.into();
        if from.is_empty() {
            return Ok(());
        }
        match self.entries.get(&from) {
            Some(existing) if *existing != to => Err(format!(
                "repository '{}' maps to both '{}' and '{}'",
                from, existing, to
            )),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(from, to);
                Ok(())
            }
        }
    }

    pub fn get(&self, from: &str) -> Option<&str> {
        self.entries.get(from).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target commit URL: `template` with the repository placeholder
    /// replaced, followed by `/<hash>`.
    pub fn commit_url(&self, template: &str, to: &str, hash: &str) -> String {
        format!(
            "{}/{}",
            template.replace(REPO_NAME_PLACEHOLDER, to).trim_end_matches('/'),
            hash
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Ticket,
    Comment,
    Commit,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Ticket => "ticket",
            RefKind::Comment => "comment",
            RefKind::Commit => "commit",
        }
    }
}

/// One reference found in content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossReference {
    pub kind: RefKind,
    /// Space segment exactly as it appears in the URL.
    pub space: String,
    /// Ticket number or commit hash.
    pub record: String,
    pub comment: Option<String>,
    pub original: String,
    pub resolved_url: Option<String>,
}

/// Result of resolving one content field.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub text: String,
    pub references: Vec<CrossReference>,
    pub warnings: Vec<Warning>,
}

impl Resolution {
    pub fn changed(&self) -> bool {
        self.references.iter().any(|r| r.resolved_url.is_some())
    }
}

/// Distinct misses accumulated over a run, reported at the end of the pass.
#[derive(Debug, Clone, Default)]
pub struct LinkMisses {
    pub projects: BTreeSet<String>,
    pub issue_keys: BTreeSet<String>,
    pub comment_ids: BTreeSet<String>,
    pub repositories: BTreeSet<String>,
}

impl LinkMisses {
    pub fn record(&mut self, warnings: &[Warning]) {
        for w in warnings {
            let set = match w.kind {
                WarningKind::MissingProject => &mut self.projects,
                WarningKind::MissingIssueKey => &mut self.issue_keys,
                WarningKind::MissingCommentId => &mut self.comment_ids,
                WarningKind::MissingRepository => &mut self.repositories,
                _ => continue,
            };
            set.insert(w.token.clone());
        }
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("missing projects", self.projects.len()),
            ("missing issue keys", self.issue_keys.len()),
            ("missing comment ids", self.comment_ids.len()),
            ("cannot find repository", self.repositories.len()),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.counts().values().all(|n| *n == 0)
    }
}

/// Rewrites source URLs into target URLs once all batches are known.
pub struct CrossReferenceResolver<'a> {
    ids: &'a GlobalIdMap,
    spaces: SpaceResolver,
    repos: &'a RepoTable,
    links: &'a LinkTemplates,
    repo_url_template: String,
    comment_re: Regex,
    ticket_re: Regex,
    commit_re: Regex,
}

impl<'a> CrossReferenceResolver<'a> {
    pub fn new(
        ids: &'a GlobalIdMap,
        spaces: SpaceResolver,
        repos: &'a RepoTable,
        links: &'a LinkTemplates,
        repo_url_template: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            ids,
            spaces,
            repos,
            links,
            repo_url_template: repo_url_template.into(),
            comment_re: Regex::new(
                r"https?://(?:[\w\-]+\.)*assembla\.com/spaces/([^/\s]+)/tickets/(\d+)[^\s?\])|]*\?comment=(\d+)(?:#comment:\d+)?",
            )?,
            ticket_re: Regex::new(
                r"https?://(?:[\w\-]+\.)*assembla\.com/spaces/([^/\s]+)/tickets/(\d+)(?:-[^\s?\])|]+)?(?:\?[^\s\])|]*)?",
            )?,
            commit_re: Regex::new(
                r"https?://(?:[\w\-]+\.)*assembla\.com/spaces/([^/\s]+)/git/commits/([a-z0-9]+)",
            )?,
        })
    }

    /// Resolve every reference in `content`, leaving the first line (the
    /// provenance header) and blank lines untouched.
    pub fn resolve(&mut self, content: &str) -> Resolution {
        let mut references = Vec::new();
        let mut warnings = Vec::new();
        let mut lines = Vec::new();
        for (i, line) in content.split('\n').enumerate() {
            if i == 0 || line.trim().is_empty() {
                lines.push(line.to_string());
                continue;
            }
            lines.push(self.resolve_line(line, &mut references, &mut warnings));
        }
        Resolution {
            text: lines.join("\n"),
            references,
            warnings,
        }
    }

    fn resolve_line(
        &mut self,
        line: &str,
        references: &mut Vec<CrossReference>,
        warnings: &mut Vec<Warning>,
    ) -> String {
        let comment_re = self.comment_re.clone();
        let ticket_re = self.ticket_re.clone();
        let commit_re = self.commit_re.clone();

        let segs = segment::open(line);
        let segs = segment::substitute(segs, &comment_re, |c| {
            let r = self.comment_link(&c[0], &c[1], &c[2], &c[3], warnings);
            let text = r.resolved_url.clone().unwrap_or_else(|| r.original.clone());
            references.push(r);
            text
        });
        let segs = segment::substitute(segs, &ticket_re, |c| {
            let r = self.ticket_link(&c[0], &c[1], &c[2], warnings);
            let text = r.resolved_url.clone().unwrap_or_else(|| r.original.clone());
            references.push(r);
            text
        });
        let segs = segment::substitute(segs, &commit_re, |c| {
            let r = self.commit_link(&c[0], &c[1], &c[2], warnings);
            let text = r.resolved_url.clone().unwrap_or_else(|| r.original.clone());
            references.push(r);
            text
        });
        segment::join(&segs)
    }

    fn issue_key(
        &mut self,
        space: &str,
        number: &str,
        warnings: &mut Vec<Warning>,
    ) -> Option<(String, String)> {
        let Some(name) = self.spaces.resolve(space) else {
            push_unique(warnings, Warning::new(WarningKind::MissingProject, space));
            return None;
        };
        match self.ids.get_in(&name, MapKind::TicketNumber, number) {
            Some(key) => Some((name, key.to_string())),
            None => {
                push_unique(
                    warnings,
                    Warning::new(WarningKind::MissingIssueKey, format!("{}#{}", name, number)),
                );
                None
            }
        }
    }

    fn ticket_link(
        &mut self,
        original: &str,
        space: &str,
        number: &str,
        warnings: &mut Vec<Warning>,
    ) -> CrossReference {
        let resolved_url = self
            .issue_key(space, number, warnings)
            .map(|(_, key)| self.links.issue_url(&key));
        CrossReference {
            kind: RefKind::Ticket,
            space: space.to_string(),
            record: number.to_string(),
            comment: None,
            original: original.to_string(),
            resolved_url,
        }
    }

    fn comment_link(
        &mut self,
        original: &str,
        space: &str,
        number: &str,
        comment: &str,
        warnings: &mut Vec<Warning>,
    ) -> CrossReference {
        let resolved_url = self.issue_key(space, number, warnings).map(|(name, key)| {
            match self.ids.get_in(&name, MapKind::CommentId, comment) {
                Some(target) => self.links.comment_url(&key, target),
                None => {
                    push_unique(warnings, Warning::new(WarningKind::MissingCommentId, comment));
                    self.links.issue_url(&key)
                }
            }
        });
        CrossReference {
            kind: RefKind::Comment,
            space: space.to_string(),
            record: number.to_string(),
            comment: Some(comment.to_string()),
            original: original.to_string(),
            resolved_url,
        }
    }

    fn commit_link(
        &mut self,
        original: &str,
        space: &str,
        hash: &str,
        warnings: &mut Vec<Warning>,
    ) -> CrossReference {
        let resolved_url = match self.repos.get(space) {
            Some(to) => Some(self.repos.commit_url(&self.repo_url_template, to, hash)),
            None => {
                push_unique(warnings, Warning::new(WarningKind::MissingRepository, space));
                None
            }
        };
        CrossReference {
            kind: RefKind::Commit,
            space: space.to_string(),
            record: hash.to_string(),
            comment: None,
            original: original.to_string(),
            resolved_url,
        }
    }
}

fn push_unique(warnings: &mut Vec<Warning>, w: Warning) {
    if !warnings.contains(&w) {
        warnings.push(w);
    }
}
