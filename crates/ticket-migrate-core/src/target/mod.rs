//! Target tracker abstraction.
//!
//! The [`TargetApi`] trait is the complete surface the migration consumes.
//! Every call reports either a success payload or an [`ApiError`]. The
//! retry-with-repair protocol depends on rejections carrying the
//! field → reason map the tracker returns:
//!
//! ```json
//! { "errorMessages": [], "errors": { "summary": "Summary can't exceed 255 characters." } }
//! ```
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::{
    IssueFields, NamedId, NewCustomField, NewProject, NewUser, TargetComment, TargetField,
    TargetIssue, TargetUser, Transition,
};

/// One field-level rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

/// A structured rejection: the tracker understood the request and refused
/// specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status: u16,
    /// Field errors in the order the tracker listed them.
    pub field_errors: Vec<FieldError>,
    pub messages: Vec<String>,
}

impl Rejection {
    pub fn field(status: u16, field: &str, reason: &str) -> Self {
        Self {
            status,
            field_errors: vec![FieldError {
                field: field.to_string(),
                reason: reason.to_string(),
            }],
            messages: Vec::new(),
        }
    }

    /// Parse a tracker error body. Returns `None` when the body does not
    /// carry the structured shape.
    pub fn from_body(status: u16, body: &serde_json::Value) -> Option<Self> {
        let errors = body.get("errors").and_then(|e| e.as_object());
        let messages = body.get("errorMessages").and_then(|m| m.as_array());
        if errors.is_none() && messages.is_none() {
            return None;
        }
        let field_errors = errors
            .map(|map| {
                map.iter()
                    .map(|(field, reason)| FieldError {
                        field: field.clone(),
                        reason: reason
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| reason.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let messages = messages
            .map(|arr| {
                arr.iter()
                    .map(|m| m.as_str().map(String::from).unwrap_or_else(|| m.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            status,
            field_errors,
            messages,
        })
    }

    /// Single-line description: `field: reason | field: reason | message`.
    pub fn message(&self) -> String {
        let mut parts: Vec<String> = self
            .field_errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.reason))
            .collect();
        parts.extend(self.messages.iter().cloned());
        if parts.is_empty() {
            format!("HTTP {}", self.status)
        } else {
            parts.join(" | ")
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Structured field-level rejection; eligible for repair.
    #[error("{0}")]
    Rejected(Rejection),
    /// Timeouts, connection failures, 5xx and unparseable responses.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ApiError::Rejected(r) => Some(r),
            ApiError::Transport(_) => None,
        }
    }
}

/// Post-hoc changes to an existing issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssueUpdate {
    pub description: Option<String>,
    /// Resolution name, e.g. `Done` or `Won't Do`.
    pub resolution: Option<String>,
}

/// Abstract target tracker.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_issue`](TargetApi::create_issue) | Create a record |
/// | [`update_issue`](TargetApi::update_issue) | Update record fields |
/// | [`create_comment`](TargetApi::create_comment) | Create a comment |
/// | [`update_comment`](TargetApi::update_comment) | Replace a comment body |
/// | [`create_custom_field`](TargetApi::create_custom_field) | Create a custom field |
/// | `list_*` | Fields, users, priorities, statuses, issue types, link types, resolutions, projects |
/// | [`transition_issue`](TargetApi::transition_issue) | Move a record to another state |
/// | [`add_watcher`](TargetApi::add_watcher) | Add a watcher |
/// | [`create_link`](TargetApi::create_link) | Link two records |
#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn create_project(&self, project: &NewProject) -> Result<NamedId, ApiError>;

    async fn list_fields(&self) -> Result<Vec<TargetField>, ApiError>;

    async fn create_custom_field(&self, field: &NewCustomField) -> Result<TargetField, ApiError>;

    async fn list_users(&self) -> Result<Vec<TargetUser>, ApiError>;

    async fn get_user(&self, account_id: &str) -> Result<Option<TargetUser>, ApiError>;

    async fn create_user(&self, user: &NewUser) -> Result<TargetUser, ApiError>;

    async fn list_priorities(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn list_statuses(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn list_issue_types(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn list_link_types(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn list_resolutions(&self) -> Result<Vec<NamedId>, ApiError>;

    async fn create_issue(&self, fields: &IssueFields) -> Result<TargetIssue, ApiError>;

    /// Update fields without notifying watchers.
    async fn update_issue(&self, issue: &str, update: &IssueUpdate) -> Result<(), ApiError>;

    async fn create_comment(&self, issue: &str, body: &str) -> Result<TargetComment, ApiError>;

    async fn update_comment(&self, issue: &str, comment_id: &str, body: &str)
        -> Result<(), ApiError>;

    async fn get_transitions(&self, issue: &str) -> Result<Vec<Transition>, ApiError>;

    async fn transition_issue(&self, issue: &str, transition_id: &str) -> Result<(), ApiError>;

    async fn add_watcher(&self, issue: &str, account_id: &str) -> Result<(), ApiError>;

    /// Link `inward` to `outward` with the named link type.
    async fn create_link(&self, link_type: &str, inward: &str, outward: &str)
        -> Result<(), ApiError>;
}
