//! Jira REST client.
//!
//! Implements [`TargetApi`] over the Jira REST API v2. Every response is
//! classified into one of three outcomes the record creator understands:
//!
//! - 2xx → success payload
//! - 4xx with `{ "errors": {...}, "errorMessages": [...] }` → [`ApiError::Rejected`]
//! - 5xx, 429, timeouts, connection failures, unparseable bodies →
//!   [`ApiError::Transport`]
//!
//! Credentials are read from the environment variables named in
//! `[target]` and sent as HTTP Basic authentication.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use ticket_migrate_core::models::{
    IssueFields, NamedId, NewCustomField, NewProject, NewUser, TargetComment, TargetField,
    TargetIssue, TargetUser, Transition,
};
use ticket_migrate_core::target::{ApiError, IssueUpdate, Rejection, TargetApi};

use crate::config::TargetConfig;

const PLUGIN_PREFIX: &str = "com.atlassian.jira.plugin.system.customfieldtypes";
const USER_PAGE_SIZE: usize = 1000;

pub struct JiraClient {
    client: reqwest::Client,
    api_root: String,
    authorization: String,
    /// Cloud addresses users by `accountId`, Server by `name`.
    cloud: bool,
    /// Custom field display name → field id, loaded on first issue create.
    field_ids: Mutex<Option<HashMap<String, String>>>,
}

impl JiraClient {
    pub fn new(
        api_root: &str,
        username: &str,
        token: &str,
        cloud: bool,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, token));
        Ok(Self {
            client,
            api_root: api_root.trim_end_matches('/').to_string(),
            authorization: format!("Basic {}", credentials),
            cloud,
            field_ids: Mutex::new(None),
        })
    }

    /// Build a client from `[target]`, reading credentials from the
    /// configured environment variables.
    pub fn from_config(config: &TargetConfig) -> Result<Self> {
        let username = std::env::var(&config.username_env).ok();
        let token = std::env::var(&config.token_env).ok();
        let (Some(username), Some(token)) = (username, token) else {
            bail!(
                "{} and {} environment variables must be set",
                config.username_env,
                config.token_env
            );
        };
        Self::new(
            &config.api_root(),
            &username,
            &token,
            config.cloud,
            config.timeout_secs,
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.api_root, path.trim_start_matches('/'));
        tracing::debug!(%method, %url, "jira request");
        self.client
            .request(method, url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| ApiError::Transport(format!("unparseable response: {}", e)));
        }

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ApiError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet(&text)
            )));
        }

        let structured = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| Rejection::from_body(status.as_u16(), &body));
        Err(ApiError::Rejected(structured.unwrap_or_else(|| Rejection {
            status: status.as_u16(),
            field_errors: Vec::new(),
            messages: if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![snippet(&text)]
            },
        })))
    }

    fn user_ref(&self, account: &str) -> Value {
        if self.cloud {
            json!({ "accountId": account })
        } else {
            json!({ "name": account })
        }
    }

    async fn custom_field_ids(&self) -> Result<HashMap<String, String>, ApiError> {
        let mut cache = self.field_ids.lock().await;
        if let Some(ids) = cache.as_ref() {
            return Ok(ids.clone());
        }
        let ids: HashMap<String, String> = self
            .list_fields()
            .await?
            .into_iter()
            .filter(|f| f.custom)
            .map(|f| (f.name, f.id))
            .collect();
        *cache = Some(ids.clone());
        Ok(ids)
    }

    /// The `fields` object for `POST /issue`.
    async fn issue_payload(&self, fields: &IssueFields) -> Result<Value, ApiError> {
        let mut map = serde_json::Map::new();
        map.insert("project".into(), json!({ "id": fields.project_id }));
        map.insert("summary".into(), json!(fields.summary));
        map.insert("issuetype".into(), json!({ "name": fields.issue_type }));
        map.insert("description".into(), json!(fields.description));
        if let Some(reporter) = &fields.reporter {
            map.insert("reporter".into(), self.user_ref(reporter));
        }
        if let Some(assignee) = &fields.assignee {
            map.insert("assignee".into(), self.user_ref(assignee));
        }
        if let Some(priority) = &fields.priority {
            map.insert("priority".into(), json!({ "name": priority }));
        }
        if !fields.labels.is_empty() {
            map.insert("labels".into(), json!(fields.labels));
        }
        if let Some(parent) = &fields.parent {
            map.insert("parent".into(), json!({ "id": parent }));
        }
        if !fields.custom.is_empty() {
            let ids = self.custom_field_ids().await?;
            for (name, value) in &fields.custom {
                match ids.get(name) {
                    Some(id) => {
                        map.insert(id.clone(), value.clone());
                    }
                    None => tracing::warn!(field = %name, "unknown custom field, value dropped"),
                }
            }
        }
        Ok(Value::Object(map))
    }
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(200) {
        Some((i, _)) => format!("{}...", &trimmed[..i]),
        None => trimmed.to_string(),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn named_ids(value: &Value) -> Vec<NamedId> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| NamedId {
                    id: str_field(item, "id"),
                    name: str_field(item, "name"),
                    key: item.get("key").and_then(|k| k.as_str()).map(String::from),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_user(value: &Value) -> TargetUser {
    let account_id = match str_field(value, "accountId") {
        id if id.is_empty() => str_field(value, "name"),
        id => id,
    };
    TargetUser {
        account_id,
        display_name: str_field(value, "displayName"),
        email: value
            .get("emailAddress")
            .and_then(|e| e.as_str())
            .map(String::from),
        active: value.get("active").and_then(|a| a.as_bool()).unwrap_or(true),
    }
}

/// Searcher registered alongside each custom field type.
fn searcher_key(kind: &str) -> &'static str {
    match kind {
        "select" | "radiobuttons" => "multiselectsearcher",
        "userpicker" => "userpickergroupsearcher",
        "float" => "exactnumber",
        "datetime" | "datepicker" => "datetimerange",
        _ => "textsearcher",
    }
}

#[async_trait]
impl TargetApi for JiraClient {
    async fn list_projects(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "project")).await?;
        Ok(named_ids(&body))
    }

    async fn create_project(&self, project: &NewProject) -> Result<NamedId, ApiError> {
        let mut payload = json!({
            "key": project.key,
            "name": project.name,
            "projectTypeKey": project.project_type,
            "description": project.description,
            "assigneeType": "UNASSIGNED",
        });
        let lead_key = if self.cloud { "leadAccountId" } else { "lead" };
        payload[lead_key] = json!(project.lead_account_id);
        let body = self
            .send(self.request(Method::POST, "project").json(&payload))
            .await?;
        Ok(NamedId {
            id: str_field(&body, "id"),
            name: project.name.clone(),
            key: Some(str_field(&body, "key")),
        })
    }

    async fn list_fields(&self) -> Result<Vec<TargetField>, ApiError> {
        let body = self.send(self.request(Method::GET, "field")).await?;
        Ok(body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|f| TargetField {
                        id: str_field(f, "id"),
                        name: str_field(f, "name"),
                        custom: f.get("custom").and_then(|c| c.as_bool()).unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_custom_field(&self, field: &NewCustomField) -> Result<TargetField, ApiError> {
        let payload = json!({
            "name": field.name,
            "description": field.description,
            "type": format!("{}:{}", PLUGIN_PREFIX, field.kind),
            "searcherKey": format!("{}:{}", PLUGIN_PREFIX, searcher_key(&field.kind)),
        });
        let body = self
            .send(self.request(Method::POST, "field").json(&payload))
            .await?;
        let created = TargetField {
            id: str_field(&body, "id"),
            name: field.name.clone(),
            custom: true,
        };
        if let Some(ids) = self.field_ids.lock().await.as_mut() {
            ids.insert(created.name.clone(), created.id.clone());
        }
        Ok(created)
    }

    async fn list_users(&self) -> Result<Vec<TargetUser>, ApiError> {
        let mut users = Vec::new();
        let mut start_at = 0;
        loop {
            let path = if self.cloud {
                format!("users/search?startAt={}&maxResults={}", start_at, USER_PAGE_SIZE)
            } else {
                format!(
                    "user/search?username=.&startAt={}&maxResults={}",
                    start_at, USER_PAGE_SIZE
                )
            };
            let body = self.send(self.request(Method::GET, &path)).await?;
            let page = body.as_array().cloned().unwrap_or_default();
            let n = page.len();
            users.extend(
                page.iter()
                    .filter(|u| {
                        u.get("accountType")
                            .and_then(|t| t.as_str())
                            .map_or(true, |t| t == "atlassian")
                    })
                    .map(parse_user),
            );
            if n < USER_PAGE_SIZE {
                break;
            }
            start_at += n;
        }
        Ok(users)
    }

    async fn get_user(&self, account_id: &str) -> Result<Option<TargetUser>, ApiError> {
        let request = if self.cloud {
            self.request(Method::GET, "user").query(&[("accountId", account_id)])
        } else {
            self.request(Method::GET, "user").query(&[("username", account_id)])
        };
        match self.send(request).await {
            Ok(body) => Ok(Some(parse_user(&body))),
            Err(ApiError::Rejected(r)) if r.status == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_user(&self, user: &NewUser) -> Result<TargetUser, ApiError> {
        let mut payload = json!({
            "emailAddress": user.email,
            "displayName": user.display_name,
        });
        if !self.cloud {
            payload["name"] = json!(user.name);
        }
        let body = self
            .send(self.request(Method::POST, "user").json(&payload))
            .await?;
        let mut created = parse_user(&body);
        if created.display_name.is_empty() {
            created.display_name = user.display_name.clone();
        }
        Ok(created)
    }

    async fn list_priorities(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "priority")).await?;
        Ok(named_ids(&body))
    }

    async fn list_statuses(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "status")).await?;
        Ok(named_ids(&body))
    }

    async fn list_issue_types(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "issuetype")).await?;
        Ok(named_ids(&body))
    }

    async fn list_link_types(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "issueLinkType")).await?;
        Ok(named_ids(body.get("issueLinkTypes").unwrap_or(&Value::Null)))
    }

    async fn list_resolutions(&self) -> Result<Vec<NamedId>, ApiError> {
        let body = self.send(self.request(Method::GET, "resolution")).await?;
        Ok(named_ids(&body))
    }

    async fn create_issue(&self, fields: &IssueFields) -> Result<TargetIssue, ApiError> {
        let payload = json!({ "fields": self.issue_payload(fields).await? });
        let body = self
            .send(self.request(Method::POST, "issue").json(&payload))
            .await?;
        let issue = TargetIssue {
            id: str_field(&body, "id"),
            key: str_field(&body, "key"),
        };
        if issue.id.is_empty() || issue.key.is_empty() {
            return Err(ApiError::Transport(
                "create issue response is missing id or key".into(),
            ));
        }
        Ok(issue)
    }

    async fn update_issue(&self, issue: &str, update: &IssueUpdate) -> Result<(), ApiError> {
        let mut fields = serde_json::Map::new();
        if let Some(description) = &update.description {
            fields.insert("description".into(), json!(description));
        }
        if let Some(resolution) = &update.resolution {
            fields.insert("resolution".into(), json!({ "name": resolution }));
        }
        let path = format!("issue/{}?notifyUsers=false", issue);
        self.send(
            self.request(Method::PUT, &path)
                .json(&json!({ "fields": fields })),
        )
        .await?;
        Ok(())
    }

    async fn create_comment(&self, issue: &str, body: &str) -> Result<TargetComment, ApiError> {
        let path = format!("issue/{}/comment", issue);
        let response = self
            .send(self.request(Method::POST, &path).json(&json!({ "body": body })))
            .await?;
        Ok(TargetComment {
            id: str_field(&response, "id"),
        })
    }

    async fn update_comment(
        &self,
        issue: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), ApiError> {
        let path = format!("issue/{}/comment/{}", issue, comment_id);
        self.send(self.request(Method::PUT, &path).json(&json!({ "body": body })))
            .await?;
        Ok(())
    }

    async fn get_transitions(&self, issue: &str) -> Result<Vec<Transition>, ApiError> {
        let path = format!("issue/{}/transitions", issue);
        let body = self.send(self.request(Method::GET, &path)).await?;
        Ok(body
            .get("transitions")
            .and_then(|t| t.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|t| Transition {
                        id: str_field(t, "id"),
                        name: str_field(t, "name"),
                        to: t.get("to").map(|to| str_field(to, "name")).unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transition_issue(&self, issue: &str, transition_id: &str) -> Result<(), ApiError> {
        let path = format!("issue/{}/transitions", issue);
        self.send(
            self.request(Method::POST, &path)
                .json(&json!({ "transition": { "id": transition_id } })),
        )
        .await?;
        Ok(())
    }

    async fn add_watcher(&self, issue: &str, account_id: &str) -> Result<(), ApiError> {
        let path = format!("issue/{}/watchers", issue);
        self.send(self.request(Method::POST, &path).json(&json!(account_id)))
            .await?;
        Ok(())
    }

    async fn create_link(
        &self,
        link_type: &str,
        inward: &str,
        outward: &str,
    ) -> Result<(), ApiError> {
        let payload = json!({
            "type": { "name": link_type },
            "inwardIssue": { "key": inward },
            "outwardIssue": { "key": outward },
        });
        self.send(self.request(Method::POST, "issueLink").json(&payload))
            .await?;
        Ok(())
    }
}
