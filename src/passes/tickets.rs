//! Create one target issue per source ticket, oldest first.
//!
//! Tickets are processed in ascending `created_on` order so that a ticket
//! referencing an older one (`#12`, or a sub-task's parent) finds it
//! already mapped. References to younger tickets stay as they are and are
//! listed in `jira-ticket-links.csv` for the links pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{json, Map, Value};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, IssueRequest};
use ticket_migrate_core::idmap::{IdentifierMap, MapKind};
use ticket_migrate_core::models::{
    creation_order, display_date, to_target_datetime, IssueFields, NamedId, SourceAssociation,
    SourceCustomField, SourceMilestone, SourceTag, SourceTicket,
};
use ticket_migrate_core::repair::RepairTable;
use ticket_migrate_core::rewrite::{ContentRewriter, RewriteOptions};

use crate::audit::{self, DiffRow, TicketLinkRow, TicketRow, UserRow};
use crate::config::Config;
use crate::tables;

use super::fields::provenance_name;
use super::{
    migrated_users, previously_ok, projects, rewriter, PassEnv, PassReport, ASSOCIATIONS_INPUT,
    CUSTOM_FIELDS_INPUT, MILESTONES_INPUT, TAGS_INPUT, TICKETS_INPUT,
};

pub const PASS: &str = "tickets";

const EPIC_NAME_FIELD: &str = "Epic Name";
const STORY_POINTS_FIELD: &str = "Story Points";

/// Issue type for a ticket, before matching against the target's names.
///
/// Hierarchy type 1 is a sub-task, 2 a story, 3 an epic. A summary that
/// starts with one of `summary_types` (e.g. `BUG: crash on save`)
/// overrides the hierarchy.
pub fn issue_type_for(ticket: &SourceTicket, default_type: &str, summary_types: &[String]) -> String {
    let summary = ticket.summary.trim_start().to_lowercase();
    if let Some(prefix) = summary_types
        .iter()
        .find(|t| !t.is_empty() && summary.starts_with(&t.to_lowercase()))
    {
        return prefix.clone();
    }
    match ticket.hierarchy_type.trim().parse::<i64>().unwrap_or(0) {
        1 => "Sub-task".to_string(),
        2 => "Story".to_string(),
        3 => "Epic".to_string(),
        _ => default_type.to_string(),
    }
}

/// Source estimate (0, 1, 3, 7) as a t-shirt size.
pub fn estimate_label(estimate: &str) -> &'static str {
    match estimate.trim().parse::<f64>().map(|e| e.round() as i64) {
        Ok(1) => "Small",
        Ok(3) => "Medium",
        Ok(7) => "Large",
        _ => "None",
    }
}

/// `assembla` plus the ticket's tags, with spaces turned into dashes.
pub fn labels_for(number: &str, tags: &[SourceTag]) -> Vec<String> {
    let mut labels = vec!["assembla".to_string()];
    for tag in tags.iter().filter(|t| t.ticket_number == number) {
        let label = tag.name.trim().replace(' ', "-");
        if !label.is_empty() && !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

/// Parse the serialized custom field map (`{"Team"=>"u1", "Size"=>"3"}`).
pub fn parse_custom_fields(raw: &str) -> Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(&raw.replace("=>", ":")) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!(value = %raw, "cannot parse custom fields");
            Map::new()
        }
    }
}

/// Numeric values the target accepts in number fields.
fn number(value: &str) -> Option<Value> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Some(json!(n));
    }
    value.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| json!(f))
}

fn non_zero(value: &str) -> Option<Value> {
    number(value).filter(|n| n.as_f64().is_some_and(|f| f != 0.0))
}

/// `YYYY-MM-DD hh:mm(:ss)` as `YYYY-MM-DDThh:mm:ss.000Z`; other shapes
/// are passed through.
pub fn custom_datetime(value: &str) -> String {
    let value = value.trim();
    let bytes = value.as_bytes();
    let shaped = |len: usize| {
        value.len() == len
            && bytes.get(10) == Some(&b' ')
            && value.chars().filter(|c| c.is_ascii_digit()).count() == if len == 19 { 14 } else { 12 }
    };
    if shaped(19) {
        format!("{}.000Z", value.replacen(' ', "T", 1))
    } else if shaped(16) {
        format!("{}:00.000Z", value.replacen(' ', "T", 1))
    } else {
        value.to_string()
    }
}

/// Everything the pass looks up while building payloads.
struct Lookups<'a> {
    config: &'a Config,
    project_id: String,
    issue_types: HashMap<String, String>,
    priorities: HashMap<String, String>,
    field_types: HashMap<String, String>,
    tags: Vec<SourceTag>,
    milestones: HashMap<String, String>,
    parents: HashMap<String, String>,
    users: HashMap<String, UserRow>,
    rewriter: ContentRewriter,
}

impl Lookups<'_> {
    /// Target spelling of an issue type name.
    fn target_type(&self, name: &str) -> Option<&str> {
        self.issue_types.get(&name.to_lowercase()).map(String::as_str)
    }

    fn user(&self, source_id: &str) -> Option<&UserRow> {
        self.users.get(source_id).filter(|u| !u.account_id.is_empty())
    }

    fn milestone(&self, id: &str) -> String {
        if id.trim().is_empty() {
            "unknown milestone".to_string()
        } else {
            self.milestones.get(id).cloned().unwrap_or_else(|| id.to_string())
        }
    }

    fn user_value(&self, user: &UserRow) -> Value {
        if self.config.target.cloud {
            json!({ "accountId": user.account_id })
        } else {
            json!({ "name": user.display_name })
        }
    }

    /// Source custom field values converted to target shapes. Values for
    /// unknown or inactive users are dropped.
    fn custom_values(&self, ticket: &SourceTicket, ctx: &RunContext) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (title, value) in parse_custom_fields(&ticket.custom_fields) {
            let text = match &value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => continue,
                other => other.to_string(),
            };
            if text.is_empty() {
                continue;
            }
            let converted = match self.field_types.get(&title).map(String::as_str) {
                Some("Numeric") => number(&text),
                Some("List") | Some("Checkbox") => Some(json!({ "value": text })),
                Some("Team List") => match self.user(&text) {
                    Some(user) if user.active && !ctx.inactive_users.contains(&user.account_id) => {
                        Some(self.user_value(user))
                    }
                    Some(_) => {
                        tracing::warn!(field = %title, user = %text, "inactive user in team list field, skipped");
                        None
                    }
                    None => {
                        tracing::warn!(field = %title, user = %text, "unknown user in team list field, skipped");
                        None
                    }
                },
                Some("Date Time") | Some("Date") => Some(json!(custom_datetime(&text))),
                _ => Some(json!(text)),
            };
            if let Some(v) = converted {
                out.insert(title, v);
            }
        }
        out
    }

    /// Provenance values keeping the source data searchable.
    fn provenance(&self, ticket: &SourceTicket, reporter: &str, assignee: Option<&str>) -> BTreeMap<String, Value> {
        let prefix = &self.config.tickets.custom_field_prefix;
        let name = |suffix: &str| provenance_name(prefix, suffix);
        let mut out = BTreeMap::new();
        out.insert(name("Id"), json!(ticket.id));
        if let Some(n) = number(&ticket.number) {
            out.insert(name("Number"), n);
        }
        for (suffix, value) in [
            ("Created-On", &ticket.created_on),
            ("Due-Date", &ticket.due_date),
            ("Completed", &ticket.completed_date),
        ] {
            if let Some(dt) = to_target_datetime(value) {
                out.insert(name(suffix), json!(dt));
            }
        }
        out.insert(name("Reporter"), json!(reporter));
        if let Some(assignee) = assignee {
            out.insert(name("Assignee"), json!(assignee));
        }
        out.insert(name("Status"), json!(ticket.status));
        if !self.milestones.is_empty() {
            out.insert(name("Milestone"), json!(self.milestone(&ticket.milestone_id)));
        }
        out.insert(name("Estimate"), json!(estimate_label(&ticket.estimate)));
        for (suffix, value) in [
            ("Worked", &ticket.total_invested_hours),
            ("Remaining", &ticket.total_working_hours),
            ("Importance", &ticket.importance),
        ] {
            if let Some(n) = non_zero(value) {
                out.insert(name(suffix), n);
            }
        }
        out
    }
}

/// Payload for one ticket, with the rewritten description body kept for
/// the diff log.
struct Built {
    fields: IssueFields,
    body: String,
    reporter_name: String,
    assignee_name: String,
    milestone: String,
}

fn build(
    ticket: &SourceTicket,
    lookups: &Lookups<'_>,
    ids: &IdentifierMap,
    ctx: &mut RunContext,
) -> Built {
    let config = lookups.config;
    let reporter = lookups.user(&ticket.reporter_id);
    let assignee = lookups.user(&ticket.assigned_to_id);
    let reporter_name = reporter
        .map(|u| u.display_name.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let assignee_name = assignee.map(|u| u.display_name.clone()).unwrap_or_default();

    let author = match reporter {
        Some(u) => lookups.rewriter.user_ref(&u.account_id),
        None => "unknown".to_string(),
    };
    let header = format!(
        "Assembla ticket [#{n}|{url}/{n}] | Author {author} | Created on {date}",
        n = ticket.number,
        url = config.source.tickets_url.trim_end_matches('/'),
        author = author,
        date = display_date(&ticket.created_on),
    );
    let rewritten = lookups.rewriter.rewrite(
        &format!("{}\n\n{}", header, ticket.description),
        ids,
        ctx,
        RewriteOptions::default(),
    );
    ctx.record_warnings(&rewritten.warnings);
    if rewritten.truncated {
        tracing::warn!(ticket = %ticket.number, "description truncated");
    }
    let summary = lookups.rewriter.rewrite(
        ticket.summary.trim(),
        ids,
        ctx,
        RewriteOptions {
            preserve_first_line: false,
            ..RewriteOptions::default()
        },
    );
    ctx.record_warnings(&summary.warnings);

    let wanted_type = issue_type_for(
        ticket,
        &config.project.default_issue_type,
        &config.project.summary_types,
    );
    let default_type = lookups
        .target_type(&config.project.default_issue_type)
        .unwrap_or(config.project.default_issue_type.as_str())
        .to_string();
    let mut issue_type = lookups
        .target_type(&wanted_type)
        .map(String::from)
        .unwrap_or_else(|| default_type.clone());

    let mut custom = lookups.provenance(ticket, &reporter_name, assignee.map(|u| u.display_name.as_str()));
    custom.extend(lookups.custom_values(ticket, ctx));

    let mut parent = None;
    match wanted_type.to_lowercase().as_str() {
        "epic" => {
            let summary = ticket.summary.trim();
            let name = match summary.get(..6) {
                Some(prefix) if prefix.eq_ignore_ascii_case("epic: ") => summary[6..].trim(),
                _ => summary,
            };
            custom.insert(EPIC_NAME_FIELD.to_string(), json!(name));
        }
        "story" => {
            if let Some(points) = non_zero(&ticket.story_importance) {
                custom.insert(STORY_POINTS_FIELD.to_string(), points);
            }
        }
        "sub-task" => {
            parent = lookups
                .parents
                .get(&ticket.id)
                .and_then(|p| ids.get(MapKind::TicketId, p))
                .map(String::from);
            if parent.is_none() {
                tracing::warn!(ticket = %ticket.number, "sub-task parent not migrated, created as {}", default_type);
                issue_type = default_type;
            }
        }
        _ => {}
    }

    let fields = IssueFields {
        project_id: lookups.project_id.clone(),
        summary: summary.text,
        issue_type,
        description: rewritten.text.clone(),
        reporter: Some(
            reporter
                .map(|u| u.account_id.clone())
                .unwrap_or_else(|| ctx.fallback_account_id.clone()),
        ),
        assignee: assignee.map(|u| u.account_id.clone()),
        priority: lookups.priorities.get(ticket.priority.trim()).cloned(),
        labels: labels_for(&ticket.number, &lookups.tags),
        parent,
        custom,
    };
    Built {
        body: rewritten.body().to_string(),
        fields,
        reporter_name,
        assignee_name,
        milestone: lookups.milestone(&ticket.milestone_id),
    }
}

fn named_map(items: Vec<NamedId>, key: impl Fn(&NamedId) -> String) -> HashMap<String, String> {
    items.into_iter().map(|n| (key(&n), n.name)).collect()
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let project_id = projects::project_id(config)?;
    let mut ids = IdentifierMap::new();
    let user_rows = migrated_users(config, &mut ids)?;
    tables::read_required_table::<audit::CustomFieldRow>(&config.output(audit::FIELDS_LOG), "fields")?;
    for user in user_rows.iter().filter(|u| audit::is_ok(&u.result) && !u.active) {
        ctx.inactive_users.insert(user.account_id.clone());
    }

    let tickets: Vec<SourceTicket> =
        tables::read_required_table(&config.input(TICKETS_INPUT), "export")?;
    let previous: Vec<TicketRow> = tables::read_optional_table(&config.output(audit::TICKETS_LOG))?;
    audit::load_ticket_map(&previous, &mut ids);
    let done = previously_ok(&previous, |r| &r.result, |r| &r.assembla_ticket_id);

    let field_types: HashMap<String, String> =
        tables::read_optional_table::<SourceCustomField>(&config.input(CUSTOM_FIELDS_INPUT))?
            .into_iter()
            .map(|f| (f.title, f.field_type))
            .collect();
    let associations: Vec<SourceAssociation> =
        tables::read_optional_table(&config.input(ASSOCIATIONS_INPUT))?;
    let parents = associations
        .into_iter()
        .filter(|a| {
            let rel = a.relationship_name.to_lowercase();
            rel.contains("story") || rel.contains("parent")
        })
        .map(|a| (a.ticket1_id, a.ticket2_id))
        .collect();

    let lookups = Lookups {
        config,
        project_id,
        issue_types: named_map(env.api.list_issue_types().await?, |n| n.name.to_lowercase()),
        priorities: named_map(env.api.list_priorities().await?, |n| n.id.clone()),
        field_types,
        tags: tables::read_optional_table(&config.input(TAGS_INPUT))?,
        milestones: tables::read_optional_table::<SourceMilestone>(&config.input(MILESTONES_INPUT))?
            .into_iter()
            .map(|m| (m.id, m.title))
            .collect(),
        parents,
        users: user_rows
            .into_iter()
            .filter(|u| audit::is_ok(&u.result))
            .map(|u| (u.assembla_id.clone(), u))
            .collect(),
        rewriter: rewriter(config)?,
    };

    // A type no ticket can be created as is a configuration error.
    let mut missing: HashSet<String> = HashSet::new();
    for ticket in &tickets {
        let wanted = issue_type_for(ticket, &config.project.default_issue_type, &config.project.summary_types);
        if lookups.target_type(&wanted).is_none() {
            missing.insert(wanted);
        }
    }
    if missing.contains(&config.project.default_issue_type) {
        bail!(
            "Issue type '{}' does not exist on the target",
            config.project.default_issue_type
        );
    }
    for name in &missing {
        tracing::warn!(issue_type = %name, "issue type missing on target, using the default type");
    }

    let table = RepairTable::standard(&config.project.default_issue_type)
        .context("Failed to compile repair rules")?;
    let unresolved = Regex::new(r"#\d+").context("Failed to compile ticket pattern")?;
    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::TICKETS_LOG)?;
    let mut diffs = env.audit(audit::TICKETS_DIFFS)?;
    let mut links = env.audit(audit::TICKET_LINKS)?;
    let total = tickets.len() as u64;
    let mut retried = 0;
    let mut with_links = 0;

    for (i, index) in creation_order(&tickets, |t| &t.created_on).into_iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        let ticket = &tickets[index];
        env.processing(PASS, counter, total);
        if done.contains(&ticket.id) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        let built = build(ticket, &lookups, &ids, ctx);
        if env.opts.dry_run {
            env.intend(format_args!(
                "create {} #{} '{}'",
                built.fields.issue_type, ticket.number, built.fields.summary
            ));
            report.record_ok();
            continue;
        }

        let mut request = IssueRequest::new(built.fields, &table, ctx);
        let outcome = create_with_repair(env.api, &mut request, ctx).await;
        let fields = &request.fields;
        let mut row = TicketRow {
            result: outcome.status().into(),
            retries: outcome.retries(),
            message: outcome.message(),
            project_id: fields.project_id.clone(),
            summary: fields.summary.clone(),
            issue_type_name: fields.issue_type.clone(),
            assignee: built.assignee_name,
            reporter: built.reporter_name,
            priority_name: fields.priority.clone().unwrap_or_default(),
            status_name: ticket.status.clone(),
            labels: fields.labels.join("|"),
            description: fields.description.clone(),
            assembla_ticket_id: ticket.id.clone(),
            assembla_ticket_number: ticket.number.clone(),
            milestone_name: built.milestone,
            counter,
            run_id: env.run_id.to_string(),
            ..TicketRow::default()
        };
        if outcome.retries() > 0 {
            retried += 1;
        }

        match &outcome.result {
            Ok(issue) => {
                row.jira_ticket_id = issue.id.clone();
                row.jira_ticket_key = issue.key.clone();
                audit::put_logged(&mut ids, MapKind::TicketNumber, &ticket.number, &issue.key);
                audit::put_logged(&mut ids, MapKind::TicketId, &ticket.id, &issue.id);
                report.record_ok();

                if built.body != ticket.description {
                    diffs.write(&DiffRow {
                        assembla_id: ticket.id.clone(),
                        jira_ticket_key: issue.key.clone(),
                        field: "description".into(),
                        before: ticket.description.clone(),
                        after: built.body.clone(),
                        ..DiffRow::default()
                    })?;
                }
                let in_summary = unresolved.is_match(&fields.summary);
                let in_description = unresolved.is_match(&built.body);
                if in_summary || in_description {
                    with_links += 1;
                    links.write(&TicketLinkRow {
                        jira_ticket_key: issue.key.clone(),
                        assembla_ticket_number: ticket.number.clone(),
                        summary: in_summary,
                        description: in_description,
                    })?;
                }
            }
            Err(failure) => report.record_nok(&failure.message),
        }
        log.write(&row)?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("retried", retried);
    report.count("with ticket references", with_links);
    report.count("distinct warnings", ctx.warnings.distinct() as u64);
    report.print();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{testing, PassOptions};
    use tempfile::TempDir;
    use ticket_migrate_core::target::memory::InMemoryTarget;
    use ticket_migrate_core::target::{ApiError, Rejection};

    fn ticket(number: &str, hierarchy: &str, summary: &str) -> SourceTicket {
        SourceTicket {
            id: format!("t{}", number),
            number: number.into(),
            summary: summary.into(),
            hierarchy_type: hierarchy.into(),
            ..SourceTicket::default()
        }
    }

    #[test]
    fn test_issue_type_selection() {
        let types = vec!["BUG".to_string(), "SPIKE".to_string()];
        assert_eq!(issue_type_for(&ticket("1", "1", "x"), "Task", &types), "Sub-task");
        assert_eq!(issue_type_for(&ticket("1", "2", "x"), "Task", &types), "Story");
        assert_eq!(issue_type_for(&ticket("1", "3", "x"), "Task", &types), "Epic");
        assert_eq!(issue_type_for(&ticket("1", "0", "x"), "Task", &types), "Task");
        assert_eq!(issue_type_for(&ticket("1", "2", "bug: crash"), "Task", &types), "BUG");
    }

    #[test]
    fn test_small_conversions() {
        assert_eq!(estimate_label("3.0"), "Medium");
        assert_eq!(estimate_label(""), "None");
        assert_eq!(custom_datetime("2019-01-02 03:04:05"), "2019-01-02T03:04:05.000Z");
        assert_eq!(custom_datetime("2019-01-02 03:04"), "2019-01-02T03:04:00.000Z");
        assert_eq!(custom_datetime("soon"), "soon");
        let tags = vec![
            SourceTag { ticket_number: "4".into(), name: "needs review".into() },
            SourceTag { ticket_number: "5".into(), name: "other".into() },
        ];
        assert_eq!(labels_for("4", &tags), vec!["assembla", "needs-review"]);
        let parsed = parse_custom_fields(r#"{"Team"=>"u1", "Size"=>"2.5"}"#);
        assert_eq!(parsed["Team"], "u1");
        assert!(parse_custom_fields("not a map").is_empty());
    }

    async fn seeded(tmp: &TempDir) -> (crate::config::Config, InMemoryTarget) {
        let config = testing::config(tmp, "");
        testing::write(
            &config.output(audit::PROJECTS_LOG),
            "result,message,project_id,project_key,name,created\nOK,,100,EA,Europeana APIs,true\n",
        );
        testing::write(
            &config.output(audit::USERS_LOG),
            "result,message,assembla_id,assembla_login,account_id,display_name,email,active,created,counter,run_id\n\
             OK,,u1,alice,acc-alice,Alice,,true,false,1,r\n\
             OK,,u2,bob,acc-bob,Bob,,false,false,2,r\n",
        );
        testing::write(&config.output(audit::FIELDS_LOG), "result,message,field_id,name,kind\n");
        testing::write(
            &config.input(CUSTOM_FIELDS_INPUT),
            "id,title,type\n1,Team,Team List\n2,Size,Numeric\n",
        );
        testing::write(
            &config.input(ASSOCIATIONS_INPUT),
            "id,ticket1_id,ticket2_id,relationship_name\na1,t3,t1,story\n",
        );
        testing::write(
            &config.input(TICKETS_INPUT),
            "id,number,summary,description,reporter_id,assigned_to_id,priority,status,custom_fields,created_on,hierarchy_type,importance,story_importance\n\
             t2,2,Second,\"See #1 and #9, ask @alice\",u1,u2,2,New,\"{\"\"Team\"\"=>\"\"u1\"\", \"\"Size\"\"=>\"\"3\"\"}\",2014-02-01 10:00:00,0,0,0\n\
             t1,1,First story,Plain,u1,,1,Done,,2014-01-01 10:00:00,2,1200,5\n\
             t3,3,A sub-task,Child,u9,,3,New,,2014-03-01 10:00:00,1,0,0\n",
        );
        (config, InMemoryTarget::new("EA"))
    }

    #[tokio::test]
    async fn test_tickets_created_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let (config, target) = seeded(&tmp).await;
        let pool = testing::memory_pool().await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());
        let mut ctx = RunContext::new("fallback");

        let report = run(&env, &mut ctx).await.unwrap();
        assert_eq!(report.ok, 3);
        assert_eq!(report.nok, 0);

        let issues = target.issues();
        assert_eq!(issues[0].fields.summary, "First story");
        assert_eq!(issues[0].fields.issue_type, "Story");
        assert_eq!(issues[0].fields.custom["Story Points"], json!(5));
        assert_eq!(issues[0].fields.custom["Assembla-Importance"], json!(1200));
        assert_eq!(issues[0].fields.priority.as_deref(), Some("Highest"));

        let second = &issues[1].fields;
        assert!(second.description.starts_with(
            "Assembla ticket [#2|https://app.assembla.com/spaces/europeana-apis/tickets/2] | Author [~accountid:acc-alice] | Created on 2014-02-01 10:00"
        ));
        assert!(second.description.contains("[EA-1|https://example.atlassian.net/browse/EA-1]"));
        assert!(second.description.contains("#9"));
        assert!(second.description.contains("[~accountid:acc-alice]"));
        // Bob is inactive: the fallback account is assigned up front.
        assert_eq!(second.assignee.as_deref(), Some("fallback"));
        assert_eq!(second.custom["Team"], json!({"accountId": "acc-alice"}));
        assert_eq!(second.custom["Size"], json!(3));
        assert_eq!(second.custom["Assembla-Estimate"], json!("None"));

        let sub = &issues[2].fields;
        assert_eq!(sub.issue_type, "Sub-task");
        assert_eq!(sub.parent.as_deref(), Some(issues[0].issue.id.as_str()));
        assert_eq!(sub.reporter.as_deref(), Some("fallback"));
        assert!(sub.description.contains("Author unknown"));

        let rows: Vec<TicketRow> = tables::read_table(&config.output(audit::TICKETS_LOG)).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].jira_ticket_key, "EA-2");
        assert_eq!(rows[1].counter, 2);
        let links: Vec<TicketLinkRow> = tables::read_table(&config.output(audit::TICKET_LINKS)).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].jira_ticket_key, "EA-2");
        assert!(links[0].description);
    }

    #[tokio::test]
    async fn test_rerun_skips_created_tickets() {
        let tmp = TempDir::new().unwrap();
        let (config, target) = seeded(&tmp).await;
        let pool = testing::memory_pool().await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        target.fail_next_create(ApiError::Transport("HTTP 503".into()));
        let first = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(first.nok, 1);
        // The story failed, so the sub-task lost its parent.
        assert_eq!(target.issues()[1].fields.issue_type, "Task");

        let second = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(second.ok, 1);
        assert_eq!(second.skipped, 2);
        assert_eq!(target.issues().len(), 3);
    }

    #[tokio::test]
    async fn test_repairs_are_logged_with_retries() {
        let tmp = TempDir::new().unwrap();
        let (config, target) = seeded(&tmp).await;
        let pool = testing::memory_pool().await;
        let opts = PassOptions {
            limit: Some(1),
            ..PassOptions::default()
        };
        let env = testing::env(&config, &target, &pool, opts);
        target.fail_next_create(ApiError::Rejected(Rejection::field(
            400,
            "reporter",
            "The reporter specified is not a user.",
        )));

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(report.checkpoint, Some(1));
        let rows: Vec<TicketRow> = tables::read_table(&config.output(audit::TICKETS_LOG)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retries, 1);
        assert_eq!(rows[0].message, "reporter: The reporter specified is not a user.");
    }

    #[tokio::test]
    async fn test_resume_continues_after_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let (config, target) = seeded(&tmp).await;
        let pool = testing::memory_pool().await;
        let mut ctx = RunContext::new("fallback");

        let first = PassOptions {
            limit: Some(1),
            ..PassOptions::default()
        };
        let report = run(&testing::env(&config, &target, &pool, first), &mut ctx).await.unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(
            crate::checkpoint::get_checkpoint(&pool, PASS, &config.source.space).await.unwrap(),
            Some(1)
        );

        let resume = PassOptions {
            resume: true,
            ..PassOptions::default()
        };
        let report = run(&testing::env(&config, &target, &pool, resume), &mut ctx).await.unwrap();
        assert_eq!(report.ok, 2);
        // The first ticket is not even revisited as a skip.
        assert_eq!(report.skipped, 0);
        assert_eq!(target.calls("create_issue"), 3);
        assert_eq!(
            crate::checkpoint::get_checkpoint(&pool, PASS, &config.source.space).await.unwrap(),
            Some(3)
        );

        let rows: Vec<TicketRow> = tables::read_table(&config.output(audit::TICKETS_LOG)).unwrap();
        let counters: Vec<u64> = rows.iter().map(|r| r.counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
        assert_eq!(rows[1].assembla_ticket_number, "2");
        // The sub-task found its parent from the first run's log.
        assert_eq!(target.issues()[2].fields.issue_type, "Sub-task");
    }

    #[tokio::test]
    async fn test_summary_references_are_rewritten() {
        let tmp = TempDir::new().unwrap();
        let (config, target) = seeded(&tmp).await;
        testing::write(
            &config.input(TICKETS_INPUT),
            "id,number,summary,description,reporter_id,created_on,hierarchy_type\n\
             t1,1,First,Plain,u1,2014-01-01 10:00:00,0\n\
             t2,2,Follow-up to #1 for @alice,Plain,u1,2014-02-01 10:00:00,0\n\
             t3,3,Blocked by #7,Plain,u1,2014-03-01 10:00:00,0\n",
        );
        let pool = testing::memory_pool().await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 3);
        let issues = target.issues();
        assert_eq!(
            issues[1].fields.summary,
            "Follow-up to [EA-1|https://example.atlassian.net/browse/EA-1] for [~accountid:acc-alice]"
        );
        assert_eq!(issues[2].fields.summary, "Blocked by #7");

        let links: Vec<TicketLinkRow> = tables::read_table(&config.output(audit::TICKET_LINKS)).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].jira_ticket_key, "EA-3");
        assert!(links[0].summary);
        assert!(!links[0].description);
    }
}
