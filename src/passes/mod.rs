//! Migration passes.
//!
//! Each pass reads its source table(s) and the audit logs of the passes
//! before it, attempts one target operation per record, and appends one
//! audit row per attempt. Passes only communicate through those logs.
//!
//! | Pass | Needs | Writes |
//! |------|-------|--------|
//! | `projects` | config | `jira-projects.csv` |
//! | `fields` | `tickets-custom-fields.csv` | `jira-custom-fields.csv` |
//! | `users` | `report-users.csv` | `jira-users.csv` |
//! | `tickets` | users, fields | `jira-tickets.csv` |
//! | `comments` | users, tickets | `jira-comments.csv` |
//! | `statuses` | tickets | `jira-tickets-status-updates.csv` |
//! | `watchers` | users, tickets | `jira-tickets-watchers.csv` |
//! | `associations` | tickets | `jira-tickets-associations.csv` |
//! | `links` | tickets and comments of every batch | `jira-links-external-*.csv` |

pub mod associations;
pub mod comments;
pub mod fields;
pub mod links;
pub mod projects;
pub mod statuses;
pub mod tickets;
pub mod users;
pub mod watchers;

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;

use ticket_migrate_core::idmap::IdentifierMap;
use ticket_migrate_core::report::FailureSummary;
use ticket_migrate_core::rewrite::{ContentRewriter, MentionStyle};
use ticket_migrate_core::target::TargetApi;
use ticket_migrate_core::xref::LinkTemplates;

use crate::audit::{self, TicketRow, UserRow};
use crate::checkpoint::{self, Window};
use crate::config::Config;
use crate::progress::{PassProgressEvent, PassProgressReporter};
use crate::tables::{self, TableWriter};

/// Passes in the order `run all` executes them.
pub const PASS_ORDER: [&str; 9] = [
    "projects",
    "fields",
    "users",
    "tickets",
    "comments",
    "statuses",
    "watchers",
    "associations",
    "links",
];

pub const USERS_INPUT: &str = "report-users.csv";
pub const TICKETS_INPUT: &str = "tickets.csv";
pub const COMMENTS_INPUT: &str = "ticket-comments.csv";
pub const ASSOCIATIONS_INPUT: &str = "ticket-associations.csv";
pub const CUSTOM_FIELDS_INPUT: &str = "tickets-custom-fields.csv";
pub const TAGS_INPUT: &str = "ticket-tags.csv";
pub const MILESTONES_INPUT: &str = "milestones-all.csv";
pub const ATTACHMENTS_LOG: &str = "jira-attachments-download.csv";

/// Command-line controls shared by every pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {
    /// Compute and rewrite everything, but make no mutating API calls.
    pub dry_run: bool,
    /// 1-based counter of the first record to attempt.
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Start after the stored checkpoint.
    pub resume: bool,
}

/// Everything a pass needs besides the run context.
pub struct PassEnv<'a> {
    pub config: &'a Config,
    pub api: &'a dyn TargetApi,
    pub pool: &'a SqlitePool,
    pub progress: &'a dyn PassProgressReporter,
    pub run_id: &'a str,
    pub opts: PassOptions,
}

impl PassEnv<'_> {
    fn space(&self) -> &str {
        &self.config.source.space
    }

    /// Records to attempt this invocation.
    pub async fn window(&self, pass: &str) -> Result<Window> {
        let resume_from = if self.opts.resume {
            checkpoint::get_checkpoint(self.pool, pass, self.space()).await?
        } else {
            None
        };
        let window = Window::resolve(self.opts.offset, self.opts.limit, resume_from);
        if window.offset > 1 {
            tracing::info!(pass, offset = window.offset, "starting past the first record");
        }
        Ok(window)
    }

    /// Record `counter` as attempted. Dry runs leave the checkpoint alone.
    pub async fn advance(&self, pass: &str, counter: u64) -> Result<()> {
        if self.opts.dry_run {
            return Ok(());
        }
        checkpoint::set_checkpoint(self.pool, pass, self.space(), counter).await
    }

    /// Open an audit log in `output.dir` for appending.
    pub fn audit(&self, file: &str) -> Result<AuditLog> {
        if self.opts.dry_run {
            return Ok(AuditLog(None));
        }
        Ok(AuditLog(Some(TableWriter::append(&self.config.output(file))?)))
    }

    pub fn preparing(&self, pass: &str) {
        self.progress.report(PassProgressEvent::Preparing {
            pass: pass.to_string(),
        });
    }

    pub fn processing(&self, pass: &str, n: u64, total: u64) {
        self.progress.report(PassProgressEvent::Processing {
            pass: pass.to_string(),
            n,
            total,
        });
    }

    /// Print a change a dry run would have made.
    pub fn intend(&self, change: std::fmt::Arguments<'_>) {
        println!("  would {}", change);
    }
}

/// An append-only audit log. Dry runs write nothing.
pub struct AuditLog(Option<TableWriter>);

impl AuditLog {
    pub fn write<T: Serialize>(&mut self, row: &T) -> Result<()> {
        match &mut self.0 {
            Some(writer) => writer.write(row),
            None => Ok(()),
        }
    }
}

/// End-of-pass counters and the grouped failure summary.
#[derive(Debug, Default)]
pub struct PassReport {
    pub pass: String,
    pub dry_run: bool,
    pub ok: u64,
    pub nok: u64,
    pub skipped: u64,
    pub failures: FailureSummary,
    pub checkpoint: Option<u64>,
    counters: Vec<(String, u64)>,
}

impl PassReport {
    pub fn new(pass: &str, dry_run: bool) -> Self {
        Self {
            pass: pass.to_string(),
            dry_run,
            ..Self::default()
        }
    }

    pub fn record_ok(&mut self) {
        self.ok += 1;
    }

    pub fn record_nok(&mut self, message: &str) {
        self.nok += 1;
        self.failures.add(message);
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn attempted(&mut self, counter: u64) {
        self.checkpoint = Some(counter);
    }

    /// Add a pass-specific counter printed after the totals.
    pub fn count(&mut self, label: impl Into<String>, n: u64) {
        self.counters.push((label.into(), n));
    }

    pub fn counters(&self) -> &[(String, u64)] {
        &self.counters
    }

    pub fn print(&self) {
        if self.dry_run {
            println!("run {} (dry-run)", self.pass);
            println!("  planned: {}", self.ok);
        } else {
            println!("run {}", self.pass);
            println!("  ok: {}", self.ok);
            println!("  nok: {}", self.nok);
        }
        println!("  skipped: {}", self.skipped);
        for (label, n) in &self.counters {
            println!("  {}: {}", label, n);
        }
        if !self.failures.is_empty() {
            println!("  failures:");
            for line in self.failures.render() {
                println!("  {}", line);
            }
        }
        if let (false, Some(counter)) = (self.dry_run, self.checkpoint) {
            println!("  checkpoint: {}", counter);
        }
        println!("ok");
    }
}

/// Content rewriter configured for the target instance, with the
/// attachment table produced by the attachment export when present.
pub fn rewriter(config: &Config) -> Result<ContentRewriter> {
    let links = LinkTemplates::new(
        config.target.base_url.clone(),
        config.links.browse_issue.clone(),
        config.links.browse_comment.clone(),
    );
    let style = if config.target.cloud {
        MentionStyle::AccountId
    } else {
        MentionStyle::UserName
    };
    let attachments = audit::load_attachments(&config.output(ATTACHMENTS_LOG))?;
    Ok(ContentRewriter::new(links, style)
        .context("Failed to compile rewrite patterns")?
        .with_attachments(attachments))
}

/// Users migrated by the `users` pass, with their identifier mappings.
pub fn migrated_users(config: &Config, ids: &mut IdentifierMap) -> Result<Vec<UserRow>> {
    let rows: Vec<UserRow> =
        tables::read_required_table(&config.output(audit::USERS_LOG), "users")?;
    audit::load_user_map(&rows, ids);
    Ok(rows)
}

/// Tickets migrated by the `tickets` pass, keyed by source ticket id.
pub fn migrated_tickets(
    config: &Config,
    ids: &mut IdentifierMap,
) -> Result<HashMap<String, TicketRow>> {
    let rows: Vec<TicketRow> =
        tables::read_required_table(&config.output(audit::TICKETS_LOG), "tickets")?;
    audit::load_ticket_map(&rows, ids);
    Ok(audit::migrated_tickets(&rows))
}

/// Ids that an earlier run of a pass already created successfully.
pub fn previously_ok<T>(rows: &[T], result: impl Fn(&T) -> &str, id: impl Fn(&T) -> &str)
    -> std::collections::HashSet<String>
{
    rows.iter()
        .filter(|r| audit::is_ok(result(r)))
        .map(|r| id(r).to_string())
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the pass tests.

    use std::path::Path;

    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    use ticket_migrate_core::target::TargetApi;

    use super::{PassEnv, PassOptions};
    use crate::config::{load_config, Config};
    use crate::progress::NoProgress;

    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::create_schema(&pool).await.unwrap();
        pool
    }

    /// A config rooted in `tmp`, with `in/` and `out/` directories.
    pub fn config(tmp: &TempDir, extra: &str) -> Config {
        let root = tmp.path();
        std::fs::create_dir_all(root.join("in")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        let content = format!(
            r#"
[target]
base_url = "https://example.atlassian.net"

[source]
space = "Europeana APIs"
tickets_url = "https://app.assembla.com/spaces/europeana-apis/tickets"
input_dir = "{root}/in"

[output]
dir = "{root}/out"
state_db = "{root}/state.sqlite"

[project]
name = "Europeana APIs"
key = "EA"
summary_types = ["BUG", "SPIKE"]

[accounts]
admin_account_id = "admin"
fallback_account_id = "fallback"
{extra}
"#,
            root = root.display(),
            extra = extra
        );
        let path = root.join("tmig.toml");
        std::fs::write(&path, content).unwrap();
        load_config(&path).unwrap()
    }

    pub fn env<'a>(
        config: &'a Config,
        api: &'a dyn TargetApi,
        pool: &'a SqlitePool,
        opts: PassOptions,
    ) -> PassEnv<'a> {
        PassEnv {
            config,
            api,
            pool,
            progress: &NoProgress,
            run_id: "test-run",
            opts,
        }
    }

    pub fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    pub fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }
}
