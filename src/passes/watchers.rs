//! Add the source notification list of every migrated ticket as watchers.

use std::collections::HashSet;

use anyhow::Result;

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, WatcherRequest};
use ticket_migrate_core::idmap::{IdentifierMap, MapKind};
use ticket_migrate_core::models::{creation_order, SourceTicket};

use crate::audit::{self, WatcherRow};
use crate::tables;

use super::{migrated_tickets, migrated_users, PassEnv, PassReport, TICKETS_INPUT};

pub const PASS: &str = "watchers";

/// Source user ids on a notification list, in order, without blanks or
/// repeats.
pub fn watcher_ids(notification_list: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    notification_list
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .collect()
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let mut ids = IdentifierMap::new();
    migrated_users(config, &mut ids)?;
    let tickets = migrated_tickets(config, &mut ids)?;
    let source: Vec<SourceTicket> =
        tables::read_required_table(&config.input(TICKETS_INPUT), "export")?;
    let order: Vec<usize> = creation_order(&source, |t| &t.created_on)
        .into_iter()
        .filter(|&i| tickets.contains_key(&source[i].id))
        .collect();

    let previous: Vec<WatcherRow> = tables::read_optional_table(&config.output(audit::WATCHERS_LOG))?;
    let done: HashSet<(String, String)> = previous
        .iter()
        .filter(|r| audit::is_ok(&r.result))
        .map(|r| (r.jira_ticket_key.clone(), r.account_id.clone()))
        .collect();

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::WATCHERS_LOG)?;
    let total = order.len() as u64;
    let mut unknown: HashSet<String> = HashSet::new();

    for (i, &index) in order.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        let ticket = &source[index];
        let Some(migrated) = tickets.get(&ticket.id) else {
            continue;
        };
        env.processing(PASS, counter, total);

        for user_id in watcher_ids(&ticket.notification_list) {
            let Some(account) = ids.get(MapKind::UserId, user_id) else {
                if unknown.insert(user_id.to_string()) {
                    tracing::warn!(user = user_id, ticket = %ticket.number, "unknown watcher");
                }
                report.record_skip();
                continue;
            };
            if done.contains(&(migrated.jira_ticket_key.clone(), account.to_string())) {
                report.record_skip();
                continue;
            }
            let mut row = WatcherRow {
                jira_ticket_key: migrated.jira_ticket_key.clone(),
                assembla_ticket_number: ticket.number.clone(),
                assembla_user_id: user_id.to_string(),
                account_id: account.to_string(),
                counter,
                run_id: env.run_id.to_string(),
                ..WatcherRow::default()
            };

            if ctx.ignored_watchers.contains(account) {
                row.result = audit::NOK.into();
                row.message = "watcher skipped after an earlier failure".into();
                report.record_nok(&row.message);
                log.write(&row)?;
                continue;
            }
            if env.opts.dry_run {
                env.intend(format_args!(
                    "add watcher {} to {}",
                    ids.get(MapKind::UserName, account).unwrap_or(account),
                    migrated.jira_ticket_key
                ));
                report.record_ok();
                continue;
            }

            let mut request = WatcherRequest {
                issue: migrated.jira_ticket_id.clone(),
                account_id: account.to_string(),
            };
            let outcome = create_with_repair(env.api, &mut request, ctx).await;
            row.result = outcome.status().into();
            row.message = outcome.message();
            match &outcome.result {
                Ok(()) => report.record_ok(),
                Err(failure) => {
                    ctx.ignored_watchers.insert(account.to_string());
                    report.record_nok(&failure.message);
                }
            }
            log.write(&row)?;
        }
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("unknown watchers", unknown.len() as u64);
    report.count("ignored watchers", ctx.ignored_watchers.len() as u64);
    if !ctx.ignored_watchers.is_empty() {
        let mut names: Vec<&str> = ctx
            .ignored_watchers
            .iter()
            .map(|a| ids.get(MapKind::UserName, a).unwrap_or(a.as_str()))
            .collect();
        names.sort_unstable();
        tracing::warn!(watchers = %names.join(", "), "watchers skipped after failing once");
    }
    report.print();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{testing, PassOptions};
    use tempfile::TempDir;
    use ticket_migrate_core::models::IssueFields;
    use ticket_migrate_core::target::memory::InMemoryTarget;
    use ticket_migrate_core::target::TargetApi;

    #[test]
    fn test_watcher_ids() {
        assert_eq!(watcher_ids("u1, u2,,u1,u3 "), vec!["u1", "u2", "u3"]);
        assert!(watcher_ids("").is_empty());
    }

    #[tokio::test]
    async fn test_failed_watcher_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        testing::write(
            &config.output(audit::USERS_LOG),
            "result,assembla_id,assembla_login,account_id,display_name,active\n\
             OK,u1,alice,acc-alice,Alice,true\n\
             OK,u2,bob,acc-bob,Bob,true\n",
        );
        testing::write(
            &config.output(audit::TICKETS_LOG),
            "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,assembla_ticket_number\n\
             OK,10001,EA-1,t1,1\nOK,10002,EA-2,t2,2\n",
        );
        testing::write(
            &config.input(TICKETS_INPUT),
            "id,number,summary,notification_list,created_on\n\
             t2,2,second,\"u2,u1\",2014-01-02 00:00:00\n\
             t1,1,first,\"u1,u2,u9\",2014-01-01 00:00:00\n\
             t3,3,not migrated,u1,2014-01-03 00:00:00\n",
        );
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        for summary in ["first", "second"] {
            target
                .create_issue(&IssueFields {
                    summary: summary.into(),
                    issue_type: "Task".into(),
                    ..IssueFields::default()
                })
                .await
                .unwrap();
        }
        target.mark_unwatchable("acc-bob");
        let env = testing::env(&config, &target, &pool, PassOptions::default());
        let mut ctx = RunContext::new("fallback");

        let report = run(&env, &mut ctx).await.unwrap();
        assert_eq!(report.ok, 2);
        assert_eq!(report.nok, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(target.calls("add_watcher"), 3);
        assert!(ctx.ignored_watchers.contains("acc-bob"));
        assert_eq!(
            target.watchers(),
            vec![
                ("EA-1".to_string(), "acc-alice".to_string()),
                ("EA-2".to_string(), "acc-alice".to_string()),
            ]
        );

        let rows: Vec<WatcherRow> = tables::read_table(&config.output(audit::WATCHERS_LOG)).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].message, "watcher skipped after an earlier failure");
    }
}
