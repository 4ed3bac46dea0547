//! Typed records flowing through the migration pipeline.
//!
//! Source rows are read once per pass from the tabular exports and never
//! mutated. Target values describe what the target tracker accepted.
//!
//! ```text
//! SourceTicket ──▶ IssueFields ──create──▶ TargetIssue
//!      │                                       │
//!      └──────────── IdentifierMap ◀───────────┘
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the source ticket export.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceTicket {
    pub id: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reporter_id: String,
    #[serde(default)]
    pub assigned_to_id: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub status: String,
    /// Embedded serialized map (`{"Team"=>"x", ...}`).
    #[serde(default)]
    pub custom_fields: String,
    #[serde(default)]
    pub milestone_id: String,
    #[serde(default)]
    pub created_on: String,
    #[serde(default)]
    pub completed_date: String,
    #[serde(default)]
    pub due_date: String,
    #[serde(default)]
    pub hierarchy_type: String,
    #[serde(default)]
    pub importance: String,
    /// Story points, for stories.
    #[serde(default)]
    pub story_importance: String,
    #[serde(default)]
    pub estimate: String,
    #[serde(default)]
    pub total_invested_hours: String,
    #[serde(default)]
    pub total_working_hours: String,
    #[serde(default)]
    pub notification_list: String,
    #[serde(default)]
    pub space_id: String,
}

/// One row of the source comment export.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceComment {
    pub id: String,
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub ticket_changes: String,
    #[serde(default)]
    pub created_on: String,
}

impl SourceComment {
    /// The comment text, falling back to the change log when the comment
    /// itself is blank.
    pub fn body(&self) -> &str {
        if self.comment.trim().is_empty() {
            &self.ticket_changes
        } else {
            &self.comment
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceUser {
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub count: String,
}

impl SourceUser {
    /// Number of records the user touched in the source space.
    pub fn activity(&self) -> u64 {
        self.count.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceAssociation {
    pub id: String,
    #[serde(default)]
    pub ticket1_id: String,
    #[serde(default)]
    pub ticket2_id: String,
    #[serde(default)]
    pub relationship_name: String,
}

/// A custom field definition from the source space.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceCustomField {
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub list_options: String,
}

/// A tag attached to a ticket; becomes a label.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceTag {
    #[serde(default)]
    pub ticket_number: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceMilestone {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// An entry of the global space export used to alias space ids and wiki
/// names back to display names.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceSpace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub wiki_name: String,
}

/// The field payload submitted when creating an issue.
///
/// Custom fields are keyed by display name; the transport resolves them to
/// target field ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssueFields {
    pub project_id: String,
    pub summary: String,
    pub issue_type: String,
    pub description: String,
    pub reporter: Option<String>,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub parent: Option<String>,
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// An issue accepted by the target tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetIssue {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetComment {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetUser {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Request to create a target user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub display_name: String,
}

/// A target field (system or custom).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetField {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub custom: bool,
}

/// Request to create a custom field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCustomField {
    pub name: String,
    pub description: String,
    /// Plugin type suffix, e.g. `textfield` or `select`.
    pub kind: String,
}

/// Id/name pair used for priorities, statuses, issue types, resolutions,
/// link types and projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedId {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Request to create a project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProject {
    pub key: String,
    pub name: String,
    pub project_type: String,
    pub lead_account_id: String,
    pub description: String,
}

/// A workflow transition available on an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub name: String,
    /// Name of the status the transition leads to.
    pub to: String,
}

/// Category of a non-fatal warning produced while migrating content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum WarningKind {
    UnknownUser,
    UnknownImage,
    UnknownTicket,
    MissingRepository,
    MissingProject,
    MissingIssueKey,
    MissingCommentId,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::UnknownUser => "user",
            WarningKind::UnknownImage => "image",
            WarningKind::UnknownTicket => "ticket",
            WarningKind::MissingRepository => "repository",
            WarningKind::MissingProject => "project",
            WarningKind::MissingIssueKey => "issue key",
            WarningKind::MissingCommentId => "comment id",
        }
    }
}

/// A structured, non-fatal warning. Identical tokens always produce
/// identical warnings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub token: String,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, token: impl Into<String>) -> Self {
        let token = token.into();
        let message = match kind {
            WarningKind::MissingRepository => format!("cannot find repository '{}'", token),
            _ => format!("{} not found: '{}'", kind.as_str(), token),
        };
        Self {
            kind,
            token,
            message,
        }
    }
}

/// Parse the timestamp formats found in the source exports.
///
/// Accepts RFC 3339 (`2014-05-12T08:33:47.000Z`), `YYYY-MM-DD HH:MM:SS`
/// with an optional ` UTC` suffix, and bare dates.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let stripped = value.trim_end_matches(" UTC");
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(stripped, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Format a source timestamp the way the target expects date-time custom
/// field values (`2014-05-12T08:33:47.000Z`).
pub fn to_target_datetime(value: &str) -> Option<String> {
    parse_timestamp(value).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S.000Z").to_string())
}

/// Human-readable date used in provenance headers.
pub fn display_date(value: &str) -> String {
    match parse_timestamp(value) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => value.to_string(),
    }
}

/// Sort indices of `items` by ascending creation timestamp, oldest first.
///
/// Rows with an unparseable timestamp sort first; ties keep input order.
pub fn creation_order<T>(items: &[T], created_on: impl Fn(&T) -> &str) -> Vec<usize> {
    let mut order: Vec<(Option<DateTime<Utc>>, usize)> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (parse_timestamp(created_on(item)), i))
        .collect();
    order.sort();
    order.into_iter().map(|(_, i)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let a = parse_timestamp("2014-05-12T08:33:47.000Z").unwrap();
        let b = parse_timestamp("2014-05-12 08:33:47 UTC").unwrap();
        let c = parse_timestamp("2014-05-12 08:33:47").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(parse_timestamp("2014-05-12").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_target_datetime() {
        assert_eq!(
            to_target_datetime("2014-05-12 08:33:47 +0200").as_deref(),
            Some("2014-05-12T06:33:47.000Z")
        );
    }

    #[test]
    fn test_creation_order_is_stable_and_ascending() {
        let rows = vec![
            ("c", "2015-01-01T00:00:00Z"),
            ("a", "2014-01-01T00:00:00Z"),
            ("b", "2014-01-01T00:00:00Z"),
        ];
        let order = creation_order(&rows, |r| r.1);
        let names: Vec<&str> = order.iter().map(|&i| rows[i].0).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_comment_body_falls_back_to_changes() {
        let c = SourceComment {
            id: "1".into(),
            comment: "  ".into(),
            ticket_changes: "- status: New\n+ status: Done".into(),
            ..Default::default()
        };
        assert!(c.body().starts_with("- status"));
    }

    #[test]
    fn test_warning_text_is_deterministic() {
        let a = Warning::new(WarningKind::UnknownTicket, "#42");
        let b = Warning::new(WarningKind::UnknownTicket, "#42");
        assert_eq!(a, b);
        assert_eq!(a.message, "ticket not found: '#42'");
    }
}
