//! Bounded create-with-repair state machine.
//!
//! ```text
//!            ┌──────────── repair applied ───────────┐
//!            ▼                                       │
//!   submit ──┬── Ok ─────────────────────────▶ OK    │
//!            ├── Transport ──────────────────▶ NOK   │
//!            └── Rejected ──┬── repair? ─────────────┘
//!                           ├── no repair ───▶ NOK
//!                           └── attempts = 3 ▶ NOK
//! ```
//!
//! Every record type goes through [`create_with_repair`]. Issues carry the
//! [`RepairTable`]; comments, watchers, links, transitions and custom
//! fields have no repair strategy and fail on their first rejection.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::models::{IssueFields, NewCustomField, TargetComment, TargetField, TargetIssue};
use crate::repair::{AppliedRepair, RepairTable};
use crate::target::{ApiError, IssueUpdate, Rejection, TargetApi};

/// Maximum number of submissions per record.
pub const MAX_ATTEMPTS: u32 = 3;

/// One logical record to create or update on the target.
#[async_trait]
pub trait CreateRequest: Send {
    type Output: Send;

    async fn submit(&self, api: &dyn TargetApi) -> Result<Self::Output, ApiError>;

    /// Modify the payload in response to `rejection`. Returning `None`
    /// ends the attempt as NOK.
    fn repair(&mut self, _rejection: &Rejection, _ctx: &mut RunContext) -> Option<AppliedRepair> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub message: String,
    pub error: ApiError,
}

/// Outcome of one [`create_with_repair`] call.
#[derive(Debug)]
pub struct CreationOutcome<T> {
    pub result: Result<T, Failure>,
    pub attempts: u32,
    pub repairs: Vec<AppliedRepair>,
}

impl<T> CreationOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Submissions after the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// `OK` or `NOK`, as written to audit logs.
    pub fn status(&self) -> &'static str {
        if self.is_ok() {
            "OK"
        } else {
            "NOK"
        }
    }

    pub fn message(&self) -> String {
        match &self.result {
            Ok(_) => self
                .repairs
                .iter()
                .map(|r| format!("{}: {}", r.field, r.reason))
                .collect::<Vec<_>>()
                .join(" | "),
            Err(f) => f.message.clone(),
        }
    }
}

/// Submit `request`, repairing and resubmitting on structured rejections
/// until it succeeds, no repair applies, or [`MAX_ATTEMPTS`] is reached.
pub async fn create_with_repair<R>(
    api: &dyn TargetApi,
    request: &mut R,
    ctx: &mut RunContext,
) -> CreationOutcome<R::Output>
where
    R: CreateRequest + ?Sized,
{
    let mut attempts = 0;
    let mut repairs = Vec::new();
    loop {
        attempts += 1;
        let error = match request.submit(api).await {
            Ok(output) => {
                return CreationOutcome {
                    result: Ok(output),
                    attempts,
                    repairs,
                }
            }
            Err(e) => e,
        };

        let repaired = match &error {
            ApiError::Rejected(rejection) if attempts < MAX_ATTEMPTS => {
                request.repair(rejection, ctx)
            }
            _ => None,
        };
        match repaired {
            Some(repair) => {
                tracing::info!(
                    field = %repair.field,
                    action = ?repair.action,
                    attempt = attempts,
                    "repairing rejected payload"
                );
                repairs.push(repair);
            }
            None => {
                tracing::warn!(attempts, error = %error, "record failed");
                return CreationOutcome {
                    result: Err(Failure {
                        message: error.to_string(),
                        error,
                    }),
                    attempts,
                    repairs,
                };
            }
        }
    }
}

/// Issue creation with the standard repair table.
pub struct IssueRequest<'a> {
    pub fields: IssueFields,
    table: &'a RepairTable,
}

impl<'a> IssueRequest<'a> {
    /// Build the request, substituting reporters and assignees the run
    /// already knows the target rejects.
    pub fn new(mut fields: IssueFields, table: &'a RepairTable, ctx: &RunContext) -> Self {
        fields.reporter = fields.reporter.map(|r| ctx.effective_reporter(&r));
        fields.assignee = fields.assignee.map(|a| ctx.effective_assignee(&a));
        Self { fields, table }
    }
}

#[async_trait]
impl CreateRequest for IssueRequest<'_> {
    type Output = TargetIssue;

    async fn submit(&self, api: &dyn TargetApi) -> Result<TargetIssue, ApiError> {
        api.create_issue(&self.fields).await
    }

    fn repair(&mut self, rejection: &Rejection, ctx: &mut RunContext) -> Option<AppliedRepair> {
        self.table.apply(&mut self.fields, rejection, ctx)
    }
}

pub struct CommentRequest {
    pub issue: String,
    pub body: String,
}

#[async_trait]
impl CreateRequest for CommentRequest {
    type Output = TargetComment;

    async fn submit(&self, api: &dyn TargetApi) -> Result<TargetComment, ApiError> {
        api.create_comment(&self.issue, &self.body).await
    }
}

pub struct CustomFieldRequest {
    pub field: NewCustomField,
}

#[async_trait]
impl CreateRequest for CustomFieldRequest {
    type Output = TargetField;

    async fn submit(&self, api: &dyn TargetApi) -> Result<TargetField, ApiError> {
        api.create_custom_field(&self.field).await
    }
}

pub struct TransitionRequest {
    pub issue: String,
    pub transition_id: String,
    /// Resolution to set once the transition went through.
    pub resolution: Option<String>,
}

#[async_trait]
impl CreateRequest for TransitionRequest {
    type Output = ();

    async fn submit(&self, api: &dyn TargetApi) -> Result<(), ApiError> {
        api.transition_issue(&self.issue, &self.transition_id).await?;
        if let Some(resolution) = &self.resolution {
            let update = IssueUpdate {
                resolution: Some(resolution.clone()),
                ..IssueUpdate::default()
            };
            api.update_issue(&self.issue, &update).await?;
        }
        Ok(())
    }
}

pub struct WatcherRequest {
    pub issue: String,
    pub account_id: String,
}

#[async_trait]
impl CreateRequest for WatcherRequest {
    type Output = ();

    async fn submit(&self, api: &dyn TargetApi) -> Result<(), ApiError> {
        api.add_watcher(&self.issue, &self.account_id).await
    }
}

pub struct LinkRequest {
    pub link_type: String,
    pub inward: String,
    pub outward: String,
}

#[async_trait]
impl CreateRequest for LinkRequest {
    type Output = ();

    async fn submit(&self, api: &dyn TargetApi) -> Result<(), ApiError> {
        api.create_link(&self.link_type, &self.inward, &self.outward).await
    }
}

/// Post-hoc content update (description or comment body).
pub enum ContentUpdate {
    Description { issue: String, text: String },
    Comment { issue: String, comment_id: String, text: String },
}

#[async_trait]
impl CreateRequest for ContentUpdate {
    type Output = ();

    async fn submit(&self, api: &dyn TargetApi) -> Result<(), ApiError> {
        match self {
            ContentUpdate::Description { issue, text } => {
                let update = IssueUpdate {
                    description: Some(text.clone()),
                    ..IssueUpdate::default()
                };
                api.update_issue(issue, &update).await
            }
            ContentUpdate::Comment {
                issue,
                comment_id,
                text,
            } => api.update_comment(issue, comment_id, text).await,
        }
    }
}
