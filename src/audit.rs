//! Audit log rows and the identifier maps rebuilt from them.
//!
//! Every pass appends one row per attempted record to its log in
//! `output.dir`. Later passes (and later runs) read the `OK` rows back to
//! rebuild the [`IdentifierMap`] entries the earlier pass created, so the
//! logs are the only hand-off between passes.
//!
//! | File | Row | Written by |
//! |------|-----|------------|
//! | `jira-projects.csv` | [`ProjectRow`] | projects |
//! | `jira-custom-fields.csv` | [`CustomFieldRow`] | fields |
//! | `jira-users.csv` | [`UserRow`] | users |
//! | `jira-tickets.csv` | [`TicketRow`] | tickets |
//! | `jira-comments.csv` | [`CommentRow`] | comments |
//! | `jira-tickets-status-updates.csv` | [`StatusRow`] | statuses |
//! | `jira-tickets-watchers.csv` | [`WatcherRow`] | watchers |
//! | `jira-tickets-associations.csv` | [`AssociationRow`] | associations, links |
//! | `jira-links-external-*.csv` | [`ExternalLinkRow`], [`ContentUpdateRow`] | links |

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use ticket_migrate_core::idmap::{IdentifierMap, MapError, MapKind};
use ticket_migrate_core::xref::RepoTable;

use crate::tables;

pub const PROJECTS_LOG: &str = "jira-projects.csv";
pub const FIELDS_LOG: &str = "jira-custom-fields.csv";
pub const USERS_LOG: &str = "jira-users.csv";
pub const TICKETS_LOG: &str = "jira-tickets.csv";
pub const TICKETS_DIFFS: &str = "jira-tickets-diffs.csv";
pub const TICKET_LINKS: &str = "jira-ticket-links.csv";
pub const COMMENTS_LOG: &str = "jira-comments.csv";
pub const COMMENTS_DIFFS: &str = "jira-comments-diffs.csv";
pub const COMMENTS_SKIPPED_EMPTY: &str = "jira-comments-skipped-empty.csv";
pub const COMMENTS_SKIPPED_COMMIT: &str = "jira-comments-skipped-commit.csv";
pub const COMMENTS_SKIPPED_DUPLICATE: &str = "jira-comments-skipped-duplicate.csv";
pub const STATUSES_LOG: &str = "jira-tickets-status-updates.csv";
pub const WATCHERS_LOG: &str = "jira-tickets-watchers.csv";
pub const ASSOCIATIONS_LOG: &str = "jira-tickets-associations.csv";
pub const LINKS_ALL: &str = "jira-links-external-all.csv";
pub const LINKS_UPDATED: &str = "jira-links-external-updated.csv";
pub const ASSOCIATIONS_EXT_LOG: &str = "jira-tickets-associations-ext.csv";

/// Logs that carry `result` and `message` columns, with the pass that
/// writes them.
pub const RESULT_LOGS: &[(&str, &str)] = &[
    ("projects", PROJECTS_LOG),
    ("fields", FIELDS_LOG),
    ("users", USERS_LOG),
    ("tickets", TICKETS_LOG),
    ("comments", COMMENTS_LOG),
    ("statuses", STATUSES_LOG),
    ("watchers", WATCHERS_LOG),
    ("associations", ASSOCIATIONS_LOG),
    ("links", LINKS_UPDATED),
    ("links", ASSOCIATIONS_EXT_LOG),
];

pub const OK: &str = "OK";
pub const NOK: &str = "NOK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectRow {
    pub result: String,
    pub message: String,
    pub project_id: String,
    pub project_key: String,
    pub name: String,
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomFieldRow {
    pub result: String,
    pub message: String,
    pub field_id: String,
    pub name: String,
    pub kind: String,
    /// Source custom field id, empty for provenance fields.
    pub assembla_field_id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRow {
    pub result: String,
    pub message: String,
    pub assembla_id: String,
    pub assembla_login: String,
    pub account_id: String,
    pub display_name: String,
    pub email: String,
    pub active: bool,
    pub created: bool,
    pub counter: u64,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketRow {
    pub result: String,
    pub retries: u32,
    pub message: String,
    pub jira_ticket_id: String,
    pub jira_ticket_key: String,
    pub project_id: String,
    pub summary: String,
    pub issue_type_name: String,
    pub assignee: String,
    pub reporter: String,
    pub priority_name: String,
    pub status_name: String,
    pub labels: String,
    /// Description as posted, provenance header included.
    pub description: String,
    pub assembla_ticket_id: String,
    pub assembla_ticket_number: String,
    pub milestone_name: String,
    pub counter: u64,
    pub run_id: String,
}

/// Before/after content of a record whose rewritten text differs from the
/// source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffRow {
    pub assembla_id: String,
    pub jira_ticket_key: String,
    pub jira_comment_id: String,
    pub field: String,
    pub before: String,
    pub after: String,
}

/// A ticket whose posted content still has unresolved `#N` references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketLinkRow {
    pub jira_ticket_key: String,
    pub assembla_ticket_number: String,
    pub summary: bool,
    pub description: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentRow {
    pub result: String,
    pub retries: u32,
    pub message: String,
    pub jira_comment_id: String,
    pub jira_ticket_id: String,
    pub jira_ticket_key: String,
    pub assembla_comment_id: String,
    pub assembla_ticket_id: String,
    pub user_login: String,
    /// Body as posted, provenance header included.
    pub body: String,
    pub created_on: String,
    pub counter: u64,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkippedCommentRow {
    pub assembla_comment_id: String,
    pub assembla_ticket_id: String,
    pub user_id: String,
    pub created_on: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRow {
    pub result: String,
    pub message: String,
    pub jira_ticket_id: String,
    pub jira_ticket_key: String,
    pub assembla_ticket_id: String,
    pub assembla_status: String,
    pub from_status: String,
    pub to_status: String,
    pub transition_id: String,
    pub resolution: String,
    pub counter: u64,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherRow {
    pub result: String,
    pub message: String,
    pub jira_ticket_key: String,
    pub assembla_ticket_number: String,
    pub assembla_user_id: String,
    pub account_id: String,
    pub counter: u64,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationRow {
    pub result: String,
    pub message: String,
    pub assembla_association_id: String,
    pub relationship_name: String,
    pub link_type: String,
    pub inward_key: String,
    pub outward_key: String,
    pub counter: u64,
    pub run_id: String,
}

/// One cross reference found by the links pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalLinkRow {
    pub space: String,
    pub jira_ticket_key: String,
    pub jira_comment_id: String,
    pub kind: String,
    pub target_space: String,
    pub record: String,
    pub original: String,
    pub resolved_url: String,
}

/// A content field rewritten by the links pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentUpdateRow {
    pub result: String,
    pub message: String,
    pub space: String,
    pub jira_ticket_key: String,
    pub jira_comment_id: String,
    pub before: String,
    pub after: String,
    pub counter: u64,
    pub run_id: String,
}

/// Attachment id → file name, as produced by the attachment export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentRow {
    pub assembla_attachment_id: String,
    pub filename: String,
}

/// Source repository → target repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoRow {
    pub from: String,
    pub to: String,
}

/// Anything with `result` and `message` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultRow {
    pub result: String,
    pub message: String,
}

pub fn is_ok(result: &str) -> bool {
    result == OK
}

/// Insert a mapping rebuilt from a log. Repeated identical entries (a pass
/// re-run without `--resume`) are ignored; conflicting ones are logged and
/// the first entry kept.
pub fn put_logged(map: &mut IdentifierMap, kind: MapKind, key: &str, value: &str) {
    if key.is_empty() || value.is_empty() {
        return;
    }
    match map.put(kind, key, value) {
        Ok(()) => {}
        Err(MapError::Duplicate {
            existing,
            attempted,
            ..
        }) if existing == attempted => {}
        Err(e) => tracing::warn!("{}", e),
    }
}

/// User id, login and display name mappings from `jira-users.csv`.
pub fn load_user_map(rows: &[UserRow], ids: &mut IdentifierMap) {
    for row in rows.iter().filter(|r| is_ok(&r.result)) {
        put_logged(ids, MapKind::UserId, &row.assembla_id, &row.account_id);
        put_logged(ids, MapKind::UserLogin, &row.assembla_login, &row.account_id);
        put_logged(ids, MapKind::UserName, &row.account_id, &row.display_name);
    }
}

/// Ticket number → key and ticket id → issue id from `jira-tickets.csv`.
pub fn load_ticket_map(rows: &[TicketRow], ids: &mut IdentifierMap) {
    for row in rows.iter().filter(|r| is_ok(&r.result)) {
        put_logged(
            ids,
            MapKind::TicketNumber,
            &row.assembla_ticket_number,
            &row.jira_ticket_key,
        );
        put_logged(ids, MapKind::TicketId, &row.assembla_ticket_id, &row.jira_ticket_id);
    }
}

pub fn load_comment_map(rows: &[CommentRow], ids: &mut IdentifierMap) {
    for row in rows.iter().filter(|r| is_ok(&r.result)) {
        put_logged(ids, MapKind::CommentId, &row.assembla_comment_id, &row.jira_comment_id);
    }
}

/// Migrated tickets keyed by source ticket id. Later rows win, so a
/// ticket re-created after a failed attempt resolves to the OK row.
pub fn migrated_tickets(rows: &[TicketRow]) -> HashMap<String, TicketRow> {
    rows.iter()
        .filter(|r| is_ok(&r.result))
        .map(|r| (r.assembla_ticket_id.clone(), r.clone()))
        .collect()
}

pub fn load_attachments(path: &Path) -> Result<HashMap<String, String>> {
    let rows: Vec<AttachmentRow> = tables::read_optional_table(path)?;
    Ok(rows
        .into_iter()
        .filter(|r| !r.assembla_attachment_id.is_empty())
        .map(|r| (r.assembla_attachment_id, r.filename))
        .collect())
}

/// Load the repository translation table. Conflicting entries are fatal:
/// commit links would otherwise resolve differently between runs.
pub fn load_repos(path: Option<&Path>) -> Result<RepoTable> {
    let mut repos = RepoTable::new();
    let Some(path) = path else {
        return Ok(repos);
    };
    let rows: Vec<RepoRow> = tables::read_table(path)?;
    for row in rows {
        repos
            .insert(row.from.trim(), row.to.trim())
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    }
    Ok(repos)
}
