//! TOML configuration for a migration run.
//!
//! ```toml
//! [target]
//! base_url = "https://example.atlassian.net"
//!
//! [source]
//! space = "Europeana APIs"
//! tickets_url = "https://app.assembla.com/spaces/europeana-apis/tickets"
//! input_dir = "./data/assembla/europeana-apis"
//!
//! [output]
//! dir = "./data/jira/europeana-apis"
//! state_db = "./data/state.sqlite"
//!
//! [project]
//! name = "Europeana APIs"
//! key = "EA"
//!
//! [accounts]
//! admin_account_id = "5b10ac8d82e05b22cc7d4ef5"
//! fallback_account_id = "5b10ac8d82e05b22cc7d4ef5"
//! ```
//!
//! Credentials never live in the file; `target.username_env` and
//! `target.token_env` name the environment variables holding them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use ticket_migrate_core::xref::{
    COMMENT_ID_PLACEHOLDER, REPO_NAME_PLACEHOLDER, TICKET_KEY_PLACEHOLDER,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub target: TargetConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub project: ProjectConfig,
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub comments: CommentsConfig,
    #[serde(default)]
    pub statuses: StatusesConfig,
    #[serde(default)]
    pub associations: AssociationsConfig,
    #[serde(default)]
    pub repos: ReposConfig,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub batches: Vec<BatchConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default = "default_api_path")]
    pub api_path: String,
    #[serde(default = "default_username_env")]
    pub username_env: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cloud instances address users by account id.
    #[serde(default = "default_true")]
    pub cloud: bool,
}

fn default_api_path() -> String {
    "/rest/api/2".to_string()
}
fn default_username_env() -> String {
    "JIRA_API_USERNAME".to_string()
}
fn default_token_env() -> String {
    "JIRA_API_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl TargetConfig {
    pub fn api_root(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_path.trim_matches('/')
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Display name of the space being migrated.
    pub space: String,
    /// Base URL of the source ticket pages, used in provenance headers.
    pub tickets_url: String,
    pub input_dir: PathBuf,
    /// Global space export used to alias space ids and wiki names.
    #[serde(default)]
    pub spaces_table: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub state_db: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub key: String,
    #[serde(default = "default_project_type")]
    pub project_type: String,
    #[serde(default = "default_issue_type")]
    pub default_issue_type: String,
    /// Summary prefixes (e.g. `BUG`, `SPIKE`) that select an issue type.
    #[serde(default)]
    pub summary_types: Vec<String>,
    #[serde(default)]
    pub lead_account_id: Option<String>,
}

fn default_project_type() -> String {
    "software".to_string()
}
fn default_issue_type() -> String {
    "Task".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountsConfig {
    pub admin_account_id: String,
    pub fallback_account_id: String,
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Rewrite user emails to `_@_` so created accounts receive no mail.
    #[serde(default = "default_true")]
    pub mangle_emails: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TicketsConfig {
    #[serde(default = "default_field_prefix")]
    pub custom_field_prefix: String,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            custom_field_prefix: default_field_prefix(),
        }
    }
}

fn default_field_prefix() -> String {
    "Assembla".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommentsConfig {
    #[serde(default = "default_true")]
    pub skip_empty: bool,
    #[serde(default)]
    pub skip_commits: bool,
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,
}

impl Default for CommentsConfig {
    fn default() -> Self {
        Self {
            skip_empty: true,
            skip_commits: false,
            skip_duplicates: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusesConfig {
    /// Source status (lowercased) → target status name.
    #[serde(default = "default_status_mapping")]
    pub mapping: BTreeMap<String, String>,
    #[serde(default = "default_initial_status")]
    pub initial: String,
    /// Source statuses resolved as `Done`.
    #[serde(default = "default_done_statuses")]
    pub done: Vec<String>,
    /// Source statuses resolved as `Won't Do`.
    #[serde(default = "default_invalid_statuses")]
    pub invalid: Vec<String>,
}

impl Default for StatusesConfig {
    fn default() -> Self {
        Self {
            mapping: default_status_mapping(),
            initial: default_initial_status(),
            done: default_done_statuses(),
            invalid: default_invalid_statuses(),
        }
    }
}

fn default_status_mapping() -> BTreeMap<String, String> {
    [
        ("new", "To Do"),
        ("in progress", "In Progress"),
        ("testable", "In Progress"),
        ("ready for acceptance", "In Progress"),
        ("in acceptance testing", "In Progress"),
        ("ready for deploy", "In Progress"),
        ("done", "Done"),
        ("invalid", "Done"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_initial_status() -> String {
    "To Do".to_string()
}
fn default_done_statuses() -> Vec<String> {
    vec!["done".to_string()]
}
fn default_invalid_statuses() -> Vec<String> {
    vec!["invalid".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssociationsConfig {
    /// Relationship names never linked (hierarchy is carried by sub-tasks).
    #[serde(default = "default_skip_associations")]
    pub skip: Vec<String>,
    /// Relationship name → link type name, applied after capitalisation.
    #[serde(default = "default_association_renames")]
    pub rename: BTreeMap<String, String>,
}

impl Default for AssociationsConfig {
    fn default() -> Self {
        Self {
            skip: default_skip_associations(),
            rename: default_association_renames(),
        }
    }
}

fn default_skip_associations() -> Vec<String> {
    ["Parent", "Child", "Story", "Subtask"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_association_renames() -> BTreeMap<String, String> {
    [("Related", "Relates"), ("Block", "Blocks"), ("Duplicate", "Duplicate")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReposConfig {
    #[serde(default = "default_repo_url_template")]
    pub url_template: String,
    /// CSV translating source repositories to target repositories.
    #[serde(default)]
    pub table: Option<PathBuf>,
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            url_template: default_repo_url_template(),
            table: None,
        }
    }
}

fn default_repo_url_template() -> String {
    format!("https://bitbucket.org/{}/commits", REPO_NAME_PLACEHOLDER)
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinksConfig {
    #[serde(default = "default_browse_issue")]
    pub browse_issue: String,
    #[serde(default = "default_browse_comment")]
    pub browse_comment: String,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            browse_issue: default_browse_issue(),
            browse_comment: default_browse_comment(),
        }
    }
}

fn default_browse_issue() -> String {
    format!("browse/{}", TICKET_KEY_PLACEHOLDER)
}
fn default_browse_comment() -> String {
    format!(
        "browse/{}?focusedCommentId={}&page=com.atlassian.jira.plugin.system.issuetabpanels%3Acomment-tabpanel#comment-{}",
        TICKET_KEY_PLACEHOLDER, COMMENT_ID_PLACEHOLDER, COMMENT_ID_PLACEHOLDER
    )
}

/// One migrated space, for the cross-batch link pass.
#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    pub space: String,
    pub key: String,
    pub output_dir: PathBuf,
}

impl Config {
    /// Batches considered by the link pass. Defaults to the configured
    /// space alone.
    pub fn link_batches(&self) -> Vec<BatchConfig> {
        if self.batches.is_empty() {
            vec![BatchConfig {
                space: self.source.space.clone(),
                key: self.project.key.clone(),
                output_dir: self.output.dir.clone(),
            }]
        } else {
            self.batches.clone()
        }
    }

    pub fn input(&self, file: &str) -> PathBuf {
        self.source.input_dir.join(file)
    }

    pub fn output(&self, file: &str) -> PathBuf {
        self.output.dir.join(file)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.target.base_url.trim().is_empty() {
        anyhow::bail!("target.base_url must not be empty");
    }
    if !config.target.base_url.starts_with("http://")
        && !config.target.base_url.starts_with("https://")
    {
        anyhow::bail!(
            "target.base_url must be an http(s) URL, got '{}'",
            config.target.base_url
        );
    }

    if config.project.key.trim().is_empty() {
        anyhow::bail!("project.key must not be empty");
    }
    if !config
        .project
        .key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        anyhow::bail!(
            "project.key must be uppercase letters and digits, got '{}'",
            config.project.key
        );
    }

    if config.accounts.admin_account_id.trim().is_empty() {
        anyhow::bail!("accounts.admin_account_id must not be empty");
    }
    if config.accounts.fallback_account_id.trim().is_empty() {
        anyhow::bail!("accounts.fallback_account_id must not be empty");
    }

    if !config.repos.url_template.contains(REPO_NAME_PLACEHOLDER) {
        anyhow::bail!(
            "repos.url_template must contain {}",
            REPO_NAME_PLACEHOLDER
        );
    }
    if !config.links.browse_issue.contains(TICKET_KEY_PLACEHOLDER) {
        anyhow::bail!("links.browse_issue must contain {}", TICKET_KEY_PLACEHOLDER);
    }
    if !config.links.browse_comment.contains(COMMENT_ID_PLACEHOLDER) {
        anyhow::bail!(
            "links.browse_comment must contain {}",
            COMMENT_ID_PLACEHOLDER
        );
    }

    for status in config.statuses.mapping.keys() {
        if status != &status.to_lowercase() {
            anyhow::bail!("statuses.mapping keys must be lowercase, got '{}'", status);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[target]
base_url = "https://example.atlassian.net/"

[source]
space = "Europeana APIs"
tickets_url = "https://app.assembla.com/spaces/europeana-apis/tickets"
input_dir = "./in"

[output]
dir = "./out"
state_db = "./state.sqlite"

[project]
name = "Europeana APIs"
key = "EA"

[accounts]
admin_account_id = "admin"
fallback_account_id = "fallback"
"#;

    fn write(content: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tmig.toml");
        fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let (_tmp, path) = write(MINIMAL);
        let config = load_config(&path).unwrap();
        assert_eq!(config.target.api_root(), "https://example.atlassian.net/rest/api/2");
        assert_eq!(config.target.token_env, "JIRA_API_TOKEN");
        assert!(config.target.cloud);
        assert_eq!(config.project.default_issue_type, "Task");
        assert_eq!(config.tickets.custom_field_prefix, "Assembla");
        assert!(config.comments.skip_empty);
        assert_eq!(config.statuses.mapping["new"], "To Do");
        assert_eq!(config.associations.rename["Related"], "Relates");
        assert_eq!(config.link_batches().len(), 1);
        assert_eq!(config.link_batches()[0].key, "EA");
    }

    #[test]
    fn test_rejects_bad_project_key() {
        let (_tmp, path) = write(&MINIMAL.replace("key = \"EA\"", "key = \"ea-1\""));
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("project.key"));
    }

    #[test]
    fn test_rejects_template_without_placeholder() {
        let content = format!("{}\n[repos]\nurl_template = \"https://bitbucket.org/org\"\n", MINIMAL);
        let (_tmp, path) = write(&content);
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("repos.url_template"));
    }

    #[test]
    fn test_batches_override_link_scope() {
        let content = format!(
            "{}\n[[batches]]\nspace = \"A\"\nkey = \"AA\"\noutput_dir = \"./a\"\n\n[[batches]]\nspace = \"B\"\nkey = \"BB\"\noutput_dir = \"./b\"\n",
            MINIMAL
        );
        let (_tmp, path) = write(&content);
        let config = load_config(&path).unwrap();
        let batches = config.link_batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].space, "B");
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/tmig.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tmig.toml"));
    }
}
