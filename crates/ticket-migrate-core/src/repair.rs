//! Targeted payload repairs for structured issue rejections.
//!
//! The table is keyed by (field, reason pattern). Field errors are examined
//! in the order the tracker listed them; the first one matching a rule
//! decides the repair, and only that repair is applied before the next
//! attempt.
//!
//! | Field | Reason | Repair |
//! |-------|--------|--------|
//! | `summary` | can't exceed 255 characters | truncate to 252 chars + `...` |
//! | `assignee` | cannot be assigned issues | fallback account, remember as unassignable |
//! | `reporter` | cannot be set | drop reporter, remember as invalid |
//! | `reporter` | is not a user | fallback account, remember as invalid |
//! | `issuetype` | is a sub-task but parent ... not specified | demote to default type, drop parent |
//! | `parent` | could not find issue by id or key | drop parent |

use regex::Regex;
use serde::Serialize;

use crate::context::RunContext;
use crate::models::IssueFields;
use crate::target::{FieldError, Rejection};

pub const SUMMARY_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepairAction {
    TruncateSummary,
    FallbackAssignee,
    DropReporter,
    FallbackReporter,
    DemoteToTask,
    DropParent,
}

#[derive(Debug)]
pub struct RepairRule {
    pub field: &'static str,
    pub reason: Regex,
    pub action: RepairAction,
}

/// A repair that changed the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedRepair {
    pub action: RepairAction,
    pub field: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct RepairTable {
    rules: Vec<RepairRule>,
    default_issue_type: String,
}

impl RepairTable {
    /// The standard rule set. Sub-tasks are demoted to `default_issue_type`.
    pub fn standard(default_issue_type: &str) -> Result<Self, regex::Error> {
        let rule = |field, pattern: &str, action| -> Result<RepairRule, regex::Error> {
            Ok(RepairRule {
                field,
                reason: Regex::new(pattern)?,
                action,
            })
        };
        Ok(Self {
            rules: vec![
                rule("summary", r"(?i)can't exceed 255 characters", RepairAction::TruncateSummary)?,
                rule("assignee", r"(?i)cannot be assigned issues", RepairAction::FallbackAssignee)?,
                rule("reporter", r"(?i)cannot be set", RepairAction::DropReporter)?,
                rule("reporter", r"(?i)is not a user", RepairAction::FallbackReporter)?,
                rule(
                    "issuetype",
                    r"(?i)is a sub-task but parent issue key or id not specified",
                    RepairAction::DemoteToTask,
                )?,
                rule("parent", r"(?i)could not find issue by id or key", RepairAction::DropParent)?,
            ],
            default_issue_type: default_issue_type.to_string(),
        })
    }

    /// First field error in `rejection` that matches a rule.
    pub fn dispatch<'r>(&self, rejection: &'r Rejection) -> Option<(&RepairRule, &'r FieldError)> {
        rejection.field_errors.iter().find_map(|err| {
            self.rules
                .iter()
                .find(|rule| {
                    rule.field.eq_ignore_ascii_case(&err.field) && rule.reason.is_match(&err.reason)
                })
                .map(|rule| (rule, err))
        })
    }

    /// Apply the repair selected by [`dispatch`](Self::dispatch). Returns
    /// `None` when no rule matches or the payload is already in the
    /// repaired shape, since retrying would only repeat the failure.
    pub fn apply(
        &self,
        fields: &mut IssueFields,
        rejection: &Rejection,
        ctx: &mut RunContext,
    ) -> Option<AppliedRepair> {
        let (rule, err) = self.dispatch(rejection)?;
        let changed = match rule.action {
            RepairAction::TruncateSummary => {
                if fields.summary.chars().count() <= SUMMARY_MAX {
                    false
                } else {
                    let mut s: String = fields.summary.chars().take(SUMMARY_MAX - 3).collect();
                    s.push_str("...");
                    fields.summary = s;
                    true
                }
            }
            RepairAction::FallbackAssignee => match fields.assignee.take() {
                Some(a) if a != ctx.fallback_account_id => {
                    ctx.unassignable.insert(a);
                    fields.assignee = Some(ctx.fallback_account_id.clone());
                    true
                }
                other => {
                    fields.assignee = other;
                    false
                }
            },
            RepairAction::DropReporter => match fields.reporter.take() {
                Some(r) => {
                    ctx.invalid_reporters.insert(r);
                    true
                }
                None => false,
            },
            RepairAction::FallbackReporter => match fields.reporter.take() {
                Some(r) if r != ctx.fallback_account_id => {
                    ctx.invalid_reporters.insert(r);
                    fields.reporter = Some(ctx.fallback_account_id.clone());
                    true
                }
                other => {
                    fields.reporter = other;
                    false
                }
            },
            RepairAction::DemoteToTask => {
                if fields.issue_type == self.default_issue_type && fields.parent.is_none() {
                    false
                } else {
                    fields.issue_type = self.default_issue_type.clone();
                    fields.parent = None;
                    true
                }
            }
            RepairAction::DropParent => fields.parent.take().is_some(),
        };
        changed.then(|| AppliedRepair {
            action: rule.action,
            field: err.field.clone(),
            reason: err.reason.clone(),
        })
    }
}
