//! Post source comments on their migrated tickets, oldest first.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, CommentRequest};
use ticket_migrate_core::idmap::{IdentifierMap, MapKind};
use ticket_migrate_core::models::{creation_order, display_date, SourceComment};
use ticket_migrate_core::rewrite::{CommitExpander, RewriteOptions};

use crate::audit::{self, CommentRow, DiffRow, SkippedCommentRow};
use crate::tables;

use super::{
    migrated_tickets, migrated_users, previously_ok, rewriter, PassEnv, PassReport, COMMENTS_INPUT,
};

pub const PASS: &str = "comments";

const COMMIT_MARKER: &str = "Commit: [[r:";

/// Why a comment is not posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Empty,
    Commit,
    Duplicate,
}

/// Hash of a comment body on a ticket, ignoring whitespace differences.
pub fn body_fingerprint(ticket_id: &str, body: &str) -> String {
    let normalised = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(ticket_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalised.as_bytes());
    hex::encode(hasher.finalize())
}

/// Skip decision for every comment, in processing order. Duplicates are
/// detected over the whole input so the decision does not depend on the
/// window being processed.
fn skip_decisions(
    comments: &[SourceComment],
    order: &[usize],
    skip_empty: bool,
    skip_commits: bool,
    skip_duplicates: bool,
) -> HashMap<usize, Skip> {
    let mut seen = HashSet::new();
    let mut out = HashMap::new();
    for &i in order {
        let comment = &comments[i];
        let body = comment.body();
        if body.trim().is_empty() {
            if skip_empty {
                out.insert(i, Skip::Empty);
            }
            continue;
        }
        if skip_commits && body.contains(COMMIT_MARKER) {
            out.insert(i, Skip::Commit);
            continue;
        }
        if skip_duplicates && !seen.insert(body_fingerprint(&comment.ticket_id, body)) {
            out.insert(i, Skip::Duplicate);
        }
    }
    out
}

fn skipped_row(comment: &SourceComment) -> SkippedCommentRow {
    SkippedCommentRow {
        assembla_comment_id: comment.id.clone(),
        assembla_ticket_id: comment.ticket_id.clone(),
        user_id: comment.user_id.clone(),
        created_on: comment.created_on.clone(),
        body: comment.body().to_string(),
    }
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let mut ids = IdentifierMap::new();
    let users: HashMap<String, String> = migrated_users(config, &mut ids)?
        .into_iter()
        .filter(|u| audit::is_ok(&u.result))
        .map(|u| (u.assembla_id, u.assembla_login))
        .collect();
    let tickets = migrated_tickets(config, &mut ids)?;
    let comments: Vec<SourceComment> =
        tables::read_required_table(&config.input(COMMENTS_INPUT), "export")?;
    let previous: Vec<CommentRow> = tables::read_optional_table(&config.output(audit::COMMENTS_LOG))?;
    let done = previously_ok(&previous, |r| &r.result, |r| &r.assembla_comment_id);

    let rewriter = rewriter(config)?;
    let expander = CommitExpander::new().context("Failed to compile commit pattern")?;
    let repos = audit::load_repos(config.repos.table.as_deref())?;
    if repos.is_empty() && !config.comments.skip_commits {
        tracing::info!("no repository table configured, commit lines are left as they are");
    }

    let order = creation_order(&comments, |c| &c.created_on);
    let skips = skip_decisions(
        &comments,
        &order,
        config.comments.skip_empty,
        config.comments.skip_commits,
        config.comments.skip_duplicates,
    );

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::COMMENTS_LOG)?;
    let mut diffs = env.audit(audit::COMMENTS_DIFFS)?;
    let mut skipped_empty = env.audit(audit::COMMENTS_SKIPPED_EMPTY)?;
    let mut skipped_commit = env.audit(audit::COMMENTS_SKIPPED_COMMIT)?;
    let mut skipped_duplicate = env.audit(audit::COMMENTS_SKIPPED_DUPLICATE)?;
    let mut skip_counts: BTreeMap<&str, u64> = BTreeMap::new();
    let mut missing_repos: BTreeMap<String, u64> = BTreeMap::new();
    let total = comments.len() as u64;

    for (i, &index) in order.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        let comment = &comments[index];
        env.processing(PASS, counter, total);

        let Some(ticket) = tickets.get(&comment.ticket_id) else {
            *skip_counts.entry("ticket not migrated").or_insert(0) += 1;
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        };
        if done.contains(&comment.id) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }
        if let Some(skip) = skips.get(&index) {
            let (label, sink) = match skip {
                Skip::Empty => ("empty", &mut skipped_empty),
                Skip::Commit => ("commit", &mut skipped_commit),
                Skip::Duplicate => ("duplicate", &mut skipped_duplicate),
            };
            sink.write(&skipped_row(comment))?;
            *skip_counts.entry(label).or_insert(0) += 1;
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        let source_body = comment.body();
        let expanded = if repos.is_empty() || !expander.is_commit(source_body) {
            source_body.to_string()
        } else {
            let (text, warnings) = expander.expand(source_body, &repos, &config.repos.url_template);
            for w in &warnings {
                *missing_repos.entry(w.token.clone()).or_insert(0) += 1;
            }
            ctx.record_warnings(&warnings);
            text
        };

        let author = match ids.get(MapKind::UserId, &comment.user_id) {
            Some(account) => rewriter.user_ref(account),
            None => "unknown".to_string(),
        };
        let header = format!(
            "Assembla | Author {} | Created on {}",
            author,
            display_date(&comment.created_on)
        );
        let rewritten = rewriter.rewrite(
            &format!("{}\n\n{}", header, expanded),
            &ids,
            ctx,
            RewriteOptions {
                preserve_first_line: true,
                strikethrough: true,
            },
        );
        ctx.record_warnings(&rewritten.warnings);
        if rewritten.truncated {
            tracing::warn!(comment = %comment.id, "comment body truncated");
        }

        if env.opts.dry_run {
            env.intend(format_args!(
                "comment on {}: {}",
                ticket.jira_ticket_key,
                rewritten.text.lines().next().unwrap_or_default()
            ));
            report.record_ok();
            continue;
        }

        let mut request = CommentRequest {
            issue: ticket.jira_ticket_key.clone(),
            body: rewritten.text.clone(),
        };
        let outcome = create_with_repair(env.api, &mut request, ctx).await;
        let mut row = CommentRow {
            result: outcome.status().into(),
            retries: outcome.retries(),
            message: outcome.message(),
            jira_ticket_id: ticket.jira_ticket_id.clone(),
            jira_ticket_key: ticket.jira_ticket_key.clone(),
            assembla_comment_id: comment.id.clone(),
            assembla_ticket_id: comment.ticket_id.clone(),
            user_login: users.get(&comment.user_id).cloned().unwrap_or_default(),
            body: request.body.clone(),
            created_on: comment.created_on.clone(),
            counter,
            run_id: env.run_id.to_string(),
            ..CommentRow::default()
        };
        match &outcome.result {
            Ok(created) => {
                row.jira_comment_id = created.id.clone();
                report.record_ok();
                if rewritten.body() != source_body {
                    diffs.write(&DiffRow {
                        assembla_id: comment.id.clone(),
                        jira_ticket_key: ticket.jira_ticket_key.clone(),
                        jira_comment_id: created.id.clone(),
                        field: "body".into(),
                        before: source_body.to_string(),
                        after: rewritten.body().to_string(),
                    })?;
                }
            }
            Err(failure) => report.record_nok(&failure.message),
        }
        log.write(&row)?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    for (label, n) in skip_counts {
        report.count(format!("skipped {}", label), n);
    }
    for (repo, n) in &missing_repos {
        tracing::warn!(repo = %repo, occurrences = n, "repository missing from the translation table");
    }
    report.count("missing repositories", missing_repos.len() as u64);
    report.print();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{testing, PassOptions};
    use tempfile::TempDir;
    use ticket_migrate_core::target::memory::InMemoryTarget;
    use ticket_migrate_core::target::TargetApi;
    use ticket_migrate_core::models::IssueFields;

    fn comment(id: &str, ticket: &str, body: &str) -> SourceComment {
        SourceComment {
            id: id.into(),
            ticket_id: ticket.into(),
            comment: body.into(),
            ..SourceComment::default()
        }
    }

    #[test]
    fn test_fingerprint_ignores_whitespace() {
        assert_eq!(body_fingerprint("t1", "a  b\n c"), body_fingerprint("t1", "a b c"));
        assert_ne!(body_fingerprint("t1", "a b"), body_fingerprint("t2", "a b"));
    }

    #[test]
    fn test_skip_decisions() {
        let comments = vec![
            comment("c1", "t1", "  "),
            comment("c2", "t1", "Commit: [[r:3:abc123|repo:1]]"),
            comment("c3", "t1", "same text"),
            comment("c4", "t1", "same   text"),
            comment("c5", "t2", "same text"),
        ];
        let order: Vec<usize> = (0..comments.len()).collect();
        let skips = skip_decisions(&comments, &order, true, true, true);
        assert_eq!(skips.get(&0), Some(&Skip::Empty));
        assert_eq!(skips.get(&1), Some(&Skip::Commit));
        assert_eq!(skips.get(&2), None);
        assert_eq!(skips.get(&3), Some(&Skip::Duplicate));
        assert_eq!(skips.get(&4), None);

        let none = skip_decisions(&comments, &order, false, false, false);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_comments_posted_with_header_and_skips() {
        let tmp = TempDir::new().unwrap();
        let repos = tmp.path().join("repos.csv");
        testing::write(&repos, "from,to\nold-repo,new-repo\n");
        let config = testing::config(
            &tmp,
            &format!("[repos]\ntable = \"{}\"\n", repos.display()),
        );
        testing::write(
            &config.output(audit::USERS_LOG),
            "result,assembla_id,assembla_login,account_id,display_name,active\nOK,u1,alice,acc-alice,Alice,true\n",
        );
        testing::write(
            &config.output(audit::TICKETS_LOG),
            "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,assembla_ticket_number\n\
             OK,10001,EA-1,t1,1\nOK,10002,EA-2,t2,2\nNOK,,,t3,3\n",
        );
        testing::write(
            &config.input(COMMENTS_INPUT),
            "id,ticket_id,user_id,comment,ticket_changes,created_on\n\
             c2,t2,u1,Fixed in #1,,2014-01-02 00:00:00\n\
             c1,t1,u1,,- status: New,2014-01-01 00:00:00\n\
             c3,t1,u9,   ,,2014-01-03 00:00:00\n\
             c4,t3,u1,orphan,,2014-01-04 00:00:00\n\
             c5,t1,u1,Commit: [[r:3:abc123|old-repo:1]],,2014-01-05 00:00:00\n",
        );
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        for summary in ["one", "two"] {
            target
                .create_issue(&IssueFields {
                    summary: summary.into(),
                    issue_type: "Task".into(),
                    ..IssueFields::default()
                })
                .await
                .unwrap();
        }
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 3);
        assert_eq!(report.skipped, 2);

        let posted = target.comments();
        assert_eq!(posted[0].issue, "EA-1");
        assert_eq!(
            posted[0].body,
            "Assembla | Author [~accountid:acc-alice] | Created on 2014-01-01 00:00\n\n- status: New"
        );
        assert!(posted[1]
            .body
            .ends_with("Fixed in -[EA-1|https://example.atlassian.net/browse/EA-1]-"));
        assert!(posted[2]
            .body
            .contains("Commit: [abc123|https://bitbucket.org/new-repo/commits/abc123]"));

        let rows: Vec<CommentRow> = tables::read_table(&config.output(audit::COMMENTS_LOG)).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].user_login, "alice");
        assert!(rows[1].body.starts_with("Assembla | Author"));
        let diffs: Vec<DiffRow> = tables::read_table(&config.output(audit::COMMENTS_DIFFS)).unwrap();
        assert_eq!(diffs.len(), 2);
        let empty = tables::count_rows(&config.output(audit::COMMENTS_SKIPPED_EMPTY)).unwrap();
        assert_eq!(empty, Some(1));

        // Nothing is posted twice.
        let again = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(again.ok, 0);
        assert_eq!(target.comments().len(), 3);
    }
}
