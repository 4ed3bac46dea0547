//! In-memory [`TargetApi`] implementation for tests and dry rehearsals.
//!
//! Issue creation applies the same field validations the hosted tracker
//! performs (summary length, assignable users, valid reporters, sub-task
//! parents) so repair paths can be exercised end to end. Additional
//! failures can be queued with [`InMemoryTarget::fail_next_create`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::models::{
    IssueFields, NamedId, NewCustomField, NewProject, NewUser, TargetComment, TargetField,
    TargetIssue, TargetUser, Transition,
};

use super::{ApiError, IssueUpdate, Rejection, TargetApi};

pub const SUMMARY_LIMIT: usize = 255;

#[derive(Default)]
struct State {
    next_id: u64,
    projects: Vec<NamedId>,
    fields: Vec<TargetField>,
    users: Vec<TargetUser>,
    priorities: Vec<NamedId>,
    statuses: Vec<NamedId>,
    issue_types: Vec<NamedId>,
    link_types: Vec<NamedId>,
    resolutions: Vec<NamedId>,
    issues: Vec<StoredIssue>,
    comments: Vec<StoredComment>,
    links: Vec<(String, String, String)>,
    watchers: Vec<(String, String)>,
    unassignable: HashSet<String>,
    invalid_reporters: HashSet<String>,
    unwatchable: HashSet<String>,
    queued_create_errors: VecDeque<ApiError>,
    calls: HashMap<&'static str, usize>,
}

/// An issue held by [`InMemoryTarget`].
#[derive(Debug, Clone)]
pub struct StoredIssue {
    pub issue: TargetIssue,
    pub fields: IssueFields,
    pub status: String,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredComment {
    pub issue: String,
    pub comment: TargetComment,
    pub body: String,
}

/// In-memory tracker seeded with the default workflow
/// (`To Do` → `In Progress` → `Done`).
pub struct InMemoryTarget {
    project_key: String,
    state: Mutex<State>,
}

impl InMemoryTarget {
    pub fn new(project_key: &str) -> Self {
        let named = |names: &[&str], base: u64| -> Vec<NamedId> {
            names
                .iter()
                .enumerate()
                .map(|(i, n)| NamedId {
                    id: (base + i as u64).to_string(),
                    name: n.to_string(),
                    key: None,
                })
                .collect()
        };
        let state = State {
            next_id: 10000,
            priorities: named(&["Highest", "High", "Medium", "Low", "Lowest"], 1),
            statuses: named(&["To Do", "In Progress", "Done"], 10),
            issue_types: named(&["Task", "Sub-task", "Story", "Epic", "Bug", "Spike"], 20),
            link_types: named(&["Relates", "Blocks", "Duplicate", "Cloners"], 30),
            resolutions: named(&["Done", "Won't Do", "Duplicate"], 40),
            ..State::default()
        };
        Self {
            project_key: project_key.to_string(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, method: &'static str) {
        *self.state().calls.entry(method).or_insert(0) += 1;
    }

    fn next_id(state: &mut State) -> String {
        state.next_id += 1;
        state.next_id.to_string()
    }

    /// Number of times `method` was called.
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub fn add_user(&self, account_id: &str, display_name: &str, active: bool) {
        self.state().users.push(TargetUser {
            account_id: account_id.to_string(),
            display_name: display_name.to_string(),
            email: None,
            active,
        });
    }

    pub fn add_field(&self, id: &str, name: &str) {
        self.state().fields.push(TargetField {
            id: id.to_string(),
            name: name.to_string(),
            custom: id.starts_with("customfield_"),
        });
    }

    /// Reject this account as an assignee.
    pub fn mark_unassignable(&self, account_id: &str) {
        self.state().unassignable.insert(account_id.to_string());
    }

    /// Reject this account as a reporter.
    pub fn mark_invalid_reporter(&self, account_id: &str) {
        self.state().invalid_reporters.insert(account_id.to_string());
    }

    pub fn mark_unwatchable(&self, account_id: &str) {
        self.state().unwatchable.insert(account_id.to_string());
    }

    /// Fail the next `create_issue` call with `error` before validation.
    pub fn fail_next_create(&self, error: ApiError) {
        self.state().queued_create_errors.push_back(error);
    }

    pub fn issues(&self) -> Vec<StoredIssue> {
        self.state().issues.clone()
    }

    pub fn comments(&self) -> Vec<StoredComment> {
        self.state().comments.clone()
    }

    pub fn links(&self) -> Vec<(String, String, String)> {
        self.state().links.clone()
    }

    pub fn watchers(&self) -> Vec<(String, String)> {
        self.state().watchers.clone()
    }

    fn validate(state: &State, fields: &IssueFields) -> Result<(), Rejection> {
        if fields.summary.chars().count() > SUMMARY_LIMIT {
            return Err(Rejection::field(
                400,
                "summary",
                "Summary can't exceed 255 characters.",
            ));
        }
        if let Some(reporter) = &fields.reporter {
            if state.invalid_reporters.contains(reporter) {
                return Err(Rejection::field(
                    400,
                    "reporter",
                    "The reporter specified is not a user.",
                ));
            }
        }
        if let Some(assignee) = &fields.assignee {
            if state.unassignable.contains(assignee) {
                return Err(Rejection::field(
                    400,
                    "assignee",
                    &format!("User '{}' cannot be assigned issues.", assignee),
                ));
            }
        }
        match &fields.parent {
            None if fields.issue_type.eq_ignore_ascii_case("sub-task") => {
                return Err(Rejection::field(
                    400,
                    "issuetype",
                    "Issue type is a sub-task but parent issue key or id not specified.",
                ));
            }
            Some(parent)
                if !state
                    .issues
                    .iter()
                    .any(|i| &i.issue.id == parent || &i.issue.key == parent) =>
            {
                return Err(Rejection::field(400, "parent", "Could not find issue by id or key."));
            }
            _ => {}
        }
        Ok(())
    }

    fn find_issue<'a>(state: &'a mut State, issue: &str) -> Result<&'a mut StoredIssue, ApiError> {
        state
            .issues
            .iter_mut()
            .find(|i| i.issue.id == issue || i.issue.key == issue)
            .ok_or_else(|| {
                ApiError::Rejected(Rejection {
                    status: 404,
                    field_errors: Vec::new(),
                    messages: vec!["Issue does not exist or you do not have permission to see it.".into()],
                })
            })
    }
}

#[async_trait]
impl TargetApi for InMemoryTarget {
    async fn list_projects(&self) -> Result<Vec<NamedId>, ApiError> {
        self.count("list_projects");
        Ok(self.state().projects.clone())
    }

    async fn create_project(&self, project: &NewProject) -> Result<NamedId, ApiError> {
        self.count("create_project");
        let mut state = self.state();
        if state.projects.iter().any(|p| p.key.as_deref() == Some(&project.key)) {
            return Err(ApiError::Rejected(Rejection::field(
                400,
                "projectKey",
                "A project with that project key already exists.",
            )));
        }
        let created = NamedId {
            id: Self::next_id(&mut state),
            name: project.name.clone(),
            key: Some(project.key.clone()),
        };
        state.projects.push(created.clone());
        Ok(created)
    }

    async fn list_fields(&self) -> Result<Vec<TargetField>, ApiError> {
        self.count("list_fields");
        Ok(self.state().fields.clone())
    }

    async fn create_custom_field(&self, field: &NewCustomField) -> Result<TargetField, ApiError> {
        self.count("create_custom_field");
        let mut state = self.state();
        let created = TargetField {
            id: format!("customfield_{}", Self::next_id(&mut state)),
            name: field.name.clone(),
            custom: true,
        };
        state.fields.push(created.clone());
        Ok(created)
    }

    async fn list_users(&self) -> Result<Vec<TargetUser>, ApiError> {
        self.count("list_users");
        Ok(self.state().users.clone())
    }

    async fn get_user(&self, account_id: &str) -> Result<Option<TargetUser>, ApiError> {
        self.count("get_user");
        Ok(self
            .state()
            .users
            .iter()
            .find(|u| u.account_id == account_id)
            .cloned())
    }

    async fn create_user(&self, user: &NewUser) -> Result<TargetUser, ApiError> {
        self.count("create_user");
        let mut state = self.state();
        let created = TargetUser {
            account_id: format!("acc-{}", Self::next_id(&mut state)),
            display_name: user.display_name.clone(),
            email: Some(user.email.clone()),
            active: true,
        };
        state.users.push(created.clone());
        Ok(created)
    }

    async fn list_priorities(&self) -> Result<Vec<NamedId>, ApiError> {
        Ok(self.state().priorities.clone())
    }

    async fn list_statuses(&self) -> Result<Vec<NamedId>, ApiError> {
        Ok(self.state().statuses.clone())
    }

    async fn list_issue_types(&self) -> Result<Vec<NamedId>, ApiError> {
        Ok(self.state().issue_types.clone())
    }

    async fn list_link_types(&self) -> Result<Vec<NamedId>, ApiError> {
        Ok(self.state().link_types.clone())
    }

    async fn list_resolutions(&self) -> Result<Vec<NamedId>, ApiError> {
        Ok(self.state().resolutions.clone())
    }

    async fn create_issue(&self, fields: &IssueFields) -> Result<TargetIssue, ApiError> {
        self.count("create_issue");
        let mut state = self.state();
        if let Some(err) = state.queued_create_errors.pop_front() {
            return Err(err);
        }
        Self::validate(&state, fields).map_err(ApiError::Rejected)?;
        let id = Self::next_id(&mut state);
        let issue = TargetIssue {
            key: format!("{}-{}", self.project_key, state.issues.len() + 1),
            id,
        };
        state.issues.push(StoredIssue {
            issue: issue.clone(),
            fields: fields.clone(),
            status: "To Do".to_string(),
            resolution: None,
        });
        Ok(issue)
    }

    async fn update_issue(&self, issue: &str, update: &IssueUpdate) -> Result<(), ApiError> {
        self.count("update_issue");
        let mut state = self.state();
        let stored = Self::find_issue(&mut state, issue)?;
        if let Some(description) = &update.description {
            stored.fields.description = description.clone();
        }
        if let Some(resolution) = &update.resolution {
            stored.resolution = Some(resolution.clone());
        }
        Ok(())
    }

    async fn create_comment(&self, issue: &str, body: &str) -> Result<TargetComment, ApiError> {
        self.count("create_comment");
        let mut state = self.state();
        let key = Self::find_issue(&mut state, issue)?.issue.key.clone();
        let comment = TargetComment {
            id: Self::next_id(&mut state),
        };
        state.comments.push(StoredComment {
            issue: key,
            comment: comment.clone(),
            body: body.to_string(),
        });
        Ok(comment)
    }

    async fn update_comment(
        &self,
        issue: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), ApiError> {
        self.count("update_comment");
        let mut state = self.state();
        let key = Self::find_issue(&mut state, issue)?.issue.key.clone();
        match state
            .comments
            .iter_mut()
            .find(|c| c.issue == key && c.comment.id == comment_id)
        {
            Some(c) => {
                c.body = body.to_string();
                Ok(())
            }
            None => Err(ApiError::Rejected(Rejection {
                status: 404,
                field_errors: Vec::new(),
                messages: vec![format!("Can not find a comment for the id: {}.", comment_id)],
            })),
        }
    }

    async fn get_transitions(&self, issue: &str) -> Result<Vec<Transition>, ApiError> {
        self.count("get_transitions");
        let mut state = self.state();
        Self::find_issue(&mut state, issue)?;
        Ok(vec![
            Transition {
                id: "11".into(),
                name: "To Do".into(),
                to: "To Do".into(),
            },
            Transition {
                id: "21".into(),
                name: "Start Progress".into(),
                to: "In Progress".into(),
            },
            Transition {
                id: "31".into(),
                name: "Done".into(),
                to: "Done".into(),
            },
        ])
    }

    async fn transition_issue(&self, issue: &str, transition_id: &str) -> Result<(), ApiError> {
        self.count("transition_issue");
        let to = match transition_id {
            "11" => "To Do",
            "21" => "In Progress",
            "31" => "Done",
            other => {
                return Err(ApiError::Rejected(Rejection::field(
                    400,
                    "transition",
                    &format!("Transition id '{}' is not valid for this issue.", other),
                )))
            }
        };
        let mut state = self.state();
        Self::find_issue(&mut state, issue)?.status = to.to_string();
        Ok(())
    }

    async fn add_watcher(&self, issue: &str, account_id: &str) -> Result<(), ApiError> {
        self.count("add_watcher");
        let mut state = self.state();
        let key = Self::find_issue(&mut state, issue)?.issue.key.clone();
        if state.unwatchable.contains(account_id) {
            return Err(ApiError::Rejected(Rejection {
                status: 400,
                field_errors: Vec::new(),
                messages: vec![format!("The user \"{}\" does not have permission to view this issue.", account_id)],
            }));
        }
        state.watchers.push((key, account_id.to_string()));
        Ok(())
    }

    async fn create_link(
        &self,
        link_type: &str,
        inward: &str,
        outward: &str,
    ) -> Result<(), ApiError> {
        self.count("create_link");
        let mut state = self.state();
        if !state.link_types.iter().any(|t| t.name == link_type) {
            return Err(ApiError::Rejected(Rejection::field(
                404,
                "issueLinkType",
                &format!("No issue link type with name '{}' found.", link_type),
            )));
        }
        Self::find_issue(&mut state, inward)?;
        Self::find_issue(&mut state, outward)?;
        state
            .links
            .push((link_type.to_string(), inward.to_string(), outward.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(summary: &str) -> IssueFields {
        IssueFields {
            project_id: "1".into(),
            summary: summary.into(),
            issue_type: "Task".into(),
            ..IssueFields::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_comment() {
        let target = InMemoryTarget::new("EA");
        let issue = target.create_issue(&fields("hello")).await.unwrap();
        assert_eq!(issue.key, "EA-1");
        let c = target.create_comment(&issue.key, "hi").await.unwrap();
        target.update_comment(&issue.id, &c.id, "bye").await.unwrap();
        assert_eq!(target.comments()[0].body, "bye");
        assert_eq!(target.calls("create_issue"), 1);
    }

    #[tokio::test]
    async fn test_validation_errors_are_structured() {
        let target = InMemoryTarget::new("EA");
        let err = target.create_issue(&fields(&"x".repeat(256))).await.unwrap_err();
        let r = err.rejection().unwrap();
        assert_eq!(r.field_errors[0].field, "summary");

        let mut sub = fields("child");
        sub.issue_type = "Sub-task".into();
        let err = target.create_issue(&sub).await.unwrap_err();
        assert_eq!(err.rejection().unwrap().field_errors[0].field, "issuetype");

        sub.parent = Some("99999".into());
        let err = target.create_issue(&sub).await.unwrap_err();
        assert_eq!(err.rejection().unwrap().field_errors[0].field, "parent");
    }

    #[tokio::test]
    async fn test_queued_failure_comes_first() {
        let target = InMemoryTarget::new("EA");
        target.fail_next_create(ApiError::Transport("timeout".into()));
        assert!(target.create_issue(&fields("a")).await.is_err());
        assert!(target.create_issue(&fields("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_transitions_and_links() {
        let target = InMemoryTarget::new("EA");
        let a = target.create_issue(&fields("a")).await.unwrap();
        let b = target.create_issue(&fields("b")).await.unwrap();
        target.transition_issue(&a.id, "31").await.unwrap();
        assert_eq!(target.issues()[0].status, "Done");
        target.create_link("Blocks", &a.id, &b.id).await.unwrap();
        assert!(target.create_link("Nope", &a.id, &b.id).await.is_err());
        assert_eq!(target.links().len(), 1);
    }
}
