//! Move migrated tickets to the target status matching their source status.
//!
//! Tickets are created in the initial status, so only tickets whose mapped
//! status differs are transitioned. Tickets closed as done or invalid also
//! get a resolution.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, TransitionRequest};
use ticket_migrate_core::models::NamedId;

use crate::audit::{self, StatusRow, TicketRow};
use crate::config::StatusesConfig;
use crate::tables;

use super::{previously_ok, PassEnv, PassReport};

pub const PASS: &str = "statuses";

const RESOLUTION_DONE: &str = "Done";
const RESOLUTION_INVALID: &str = "Won't Do";

/// Target status for a source status, matched case-insensitively.
pub fn target_status<'c>(config: &'c StatusesConfig, source: &str) -> Option<&'c str> {
    config
        .mapping
        .get(&source.trim().to_lowercase())
        .map(String::as_str)
}

/// Resolution to set once a ticket reached its closed status.
pub fn resolution_for(config: &StatusesConfig, source: &str) -> Option<&'static str> {
    let source = source.trim();
    if config.invalid.iter().any(|s| s.eq_ignore_ascii_case(source)) {
        Some(RESOLUTION_INVALID)
    } else if config.done.iter().any(|s| s.eq_ignore_ascii_case(source)) {
        Some(RESOLUTION_DONE)
    } else {
        None
    }
}

/// OK ticket rows, once per source ticket, in the order they were created.
fn migrated_in_order(rows: Vec<TicketRow>) -> Vec<TicketRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|r| audit::is_ok(&r.result))
        .filter(|r| seen.insert(r.assembla_ticket_id.clone()))
        .collect()
}

/// Every status the tickets need must be mapped and exist on the target.
fn check_statuses(config: &StatusesConfig, tickets: &[TicketRow], target: &[NamedId]) -> Result<()> {
    let known: HashSet<String> = target.iter().map(|s| s.name.to_lowercase()).collect();
    let mut unmapped: Vec<&str> = Vec::new();
    let mut missing: Vec<&str> = Vec::new();
    for ticket in tickets {
        match target_status(config, &ticket.status_name) {
            None => unmapped.push(&ticket.status_name),
            Some(status) if !known.contains(&status.to_lowercase()) => missing.push(status),
            Some(_) => {}
        }
    }
    unmapped.sort_unstable();
    unmapped.dedup();
    missing.sort_unstable();
    missing.dedup();
    if !unmapped.is_empty() {
        bail!(
            "Source statuses without a mapping: {} (add them to [statuses] mapping)",
            unmapped.join(", ")
        );
    }
    if !missing.is_empty() {
        bail!(
            "Target statuses do not exist: {} (create them in the target workflow)",
            missing.join(", ")
        );
    }
    Ok(())
}

/// Transition ids by target status name, learned from the issues seen so far.
#[derive(Default)]
struct Transitions {
    by_status: HashMap<String, String>,
}

impl Transitions {
    async fn find(&mut self, env: &PassEnv<'_>, issue: &str, status: &str) -> Result<Option<String>> {
        let key = status.to_lowercase();
        if let Some(id) = self.by_status.get(&key) {
            return Ok(Some(id.clone()));
        }
        for t in env.api.get_transitions(issue).await? {
            self.by_status.entry(t.to.to_lowercase()).or_insert(t.id);
        }
        tracing::debug!(issue, known = self.by_status.len(), "transitions fetched");
        Ok(self.by_status.get(&key).cloned())
    }
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let statuses = &config.statuses;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let tickets = migrated_in_order(tables::read_required_table(
        &config.output(audit::TICKETS_LOG),
        "tickets",
    )?);
    check_statuses(statuses, &tickets, &env.api.list_statuses().await?)?;

    let resolutions: HashMap<String, String> = env
        .api
        .list_resolutions()
        .await?
        .into_iter()
        .map(|r| (r.name.to_lowercase(), r.name))
        .collect();
    let previous: Vec<StatusRow> = tables::read_optional_table(&config.output(audit::STATUSES_LOG))?;
    let done = previously_ok(&previous, |r| &r.result, |r| &r.assembla_ticket_id);

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::STATUSES_LOG)?;
    let mut transitions = Transitions::default();
    let mut unchanged = 0;
    let total = tickets.len() as u64;

    for (i, ticket) in tickets.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        env.processing(PASS, counter, total);

        let Some(to_status) = target_status(statuses, &ticket.status_name) else {
            continue;
        };
        if done.contains(&ticket.assembla_ticket_id) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }
        if to_status.eq_ignore_ascii_case(&statuses.initial) {
            unchanged += 1;
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        let resolution = resolution_for(statuses, &ticket.status_name).and_then(|name| {
            let found = resolutions.get(&name.to_lowercase()).cloned();
            if found.is_none() {
                tracing::warn!(resolution = name, "resolution does not exist on the target");
            }
            found
        });

        let mut row = StatusRow {
            jira_ticket_id: ticket.jira_ticket_id.clone(),
            jira_ticket_key: ticket.jira_ticket_key.clone(),
            assembla_ticket_id: ticket.assembla_ticket_id.clone(),
            assembla_status: ticket.status_name.clone(),
            from_status: statuses.initial.clone(),
            to_status: to_status.to_string(),
            resolution: resolution.clone().unwrap_or_default(),
            counter,
            run_id: env.run_id.to_string(),
            ..StatusRow::default()
        };

        let transition = match transitions
            .find(env, &ticket.jira_ticket_id, to_status)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                row.result = audit::NOK.into();
                row.message = format!("No transition to '{}' available", to_status);
                report.record_nok(&row.message);
                log.write(&row)?;
                env.advance(PASS, counter).await?;
                report.attempted(counter);
                continue;
            }
            Err(e) => {
                row.result = audit::NOK.into();
                row.message = e.to_string();
                report.record_nok(&row.message);
                log.write(&row)?;
                env.advance(PASS, counter).await?;
                report.attempted(counter);
                continue;
            }
        };
        row.transition_id = transition.clone();

        if env.opts.dry_run {
            env.intend(format_args!(
                "transition {} '{}' => '{}'{}",
                ticket.jira_ticket_key,
                statuses.initial,
                to_status,
                resolution
                    .as_deref()
                    .map(|r| format!(" (resolution {})", r))
                    .unwrap_or_default()
            ));
            report.record_ok();
            continue;
        }

        let mut request = TransitionRequest {
            issue: ticket.jira_ticket_id.clone(),
            transition_id: transition,
            resolution,
        };
        let outcome = create_with_repair(env.api, &mut request, ctx).await;
        row.result = outcome.status().into();
        row.message = outcome.message();
        match &outcome.result {
            Ok(()) => report.record_ok(),
            Err(failure) => report.record_nok(&failure.message),
        }
        log.write(&row)?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("already in initial status", unchanged);
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

    const TICKETS: &str = "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,assembla_ticket_number,status_name\n\
        OK,10001,EA-1,t1,1,New\n\
        OK,10002,EA-2,t2,2,Done\n\
        OK,10003,EA-3,t3,3,Invalid\n\
        OK,10004,EA-4,t4,4,Testable\n\
        NOK,,,t5,5,Done\n";

    async fn seeded(n: usize) -> InMemoryTarget {
        let target = InMemoryTarget::new("EA");
        for i in 0..n {
            target
                .create_issue(&IssueFields {
                    summary: format!("ticket {}", i + 1),
                    issue_type: "Task".into(),
                    ..IssueFields::default()
                })
                .await
                .unwrap();
        }
        target
    }

    #[test]
    fn test_status_and_resolution_rules() {
        let config = StatusesConfig::default();
        assert_eq!(target_status(&config, "Ready for Deploy"), Some("In Progress"));
        assert_eq!(target_status(&config, "Parked"), None);
        assert_eq!(resolution_for(&config, "Done"), Some("Done"));
        assert_eq!(resolution_for(&config, "invalid"), Some("Won't Do"));
        assert_eq!(resolution_for(&config, "In Progress"), None);
    }

    #[tokio::test]
    async fn test_transitions_and_resolutions() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        testing::write(&config.output(audit::TICKETS_LOG), TICKETS);
        let pool = testing::memory_pool().await;
        let target = seeded(4).await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(target.calls("get_transitions"), 1);

        let issues = target.issues();
        assert_eq!(issues[0].status, "To Do");
        assert_eq!(issues[1].status, "Done");
        assert_eq!(issues[1].resolution.as_deref(), Some("Done"));
        assert_eq!(issues[2].resolution.as_deref(), Some("Won't Do"));
        assert_eq!(issues[3].status, "In Progress");
        assert_eq!(issues[3].resolution, None);

        let rows: Vec<StatusRow> = tables::read_table(&config.output(audit::STATUSES_LOG)).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].transition_id, "31");
        assert_eq!(rows[2].to_status, "In Progress");

        let again = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(again.ok, 0);
        assert_eq!(target.calls("transition_issue"), 3);
    }

    #[tokio::test]
    async fn test_unmapped_status_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        testing::write(
            &config.output(audit::TICKETS_LOG),
            "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,status_name\nOK,10001,EA-1,t1,Parked\n",
        );
        let pool = testing::memory_pool().await;
        let target = seeded(1).await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let err = run(&env, &mut RunContext::new("fallback")).await.unwrap_err();
        assert!(err.to_string().contains("Parked"));
        assert_eq!(target.calls("transition_issue"), 0);
    }

    #[tokio::test]
    async fn test_missing_target_status_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "[statuses.mapping]\nparked = \"Parked\"\n");
        testing::write(
            &config.output(audit::TICKETS_LOG),
            "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,status_name\nOK,10001,EA-1,t1,Parked\n",
        );
        let pool = testing::memory_pool().await;
        let target = seeded(1).await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let err = run(&env, &mut RunContext::new("fallback")).await.unwrap_err();
        assert!(err.to_string().contains("Target statuses do not exist: Parked"));
    }
}
