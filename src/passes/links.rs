//! External links: rewrite source URLs that point into other batches.
//!
//! Runs once every batch listed in `[[batches]]` has created its tickets
//! and comments. The audit logs of all batches are merged into one
//! [`GlobalIdMap`]; each migrated description and comment body of this
//! batch is scanned for ticket, comment and commit URLs, and content that
//! changed is written back. Associations whose tickets live in different
//! batches are linked here as well.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, ContentUpdate, LinkRequest};
use ticket_migrate_core::idmap::{GlobalIdMap, IdentifierMap, SpaceResolver};
use ticket_migrate_core::models::{SourceAssociation, SourceSpace};
use ticket_migrate_core::xref::{CrossReferenceResolver, LinkMisses, LinkTemplates};

use crate::audit::{
    self, AssociationRow, CommentRow, ContentUpdateRow, ExternalLinkRow, TicketRow,
};
use crate::config::{BatchConfig, Config};
use crate::tables;

use super::associations::{check_link_types, link_type_for};
use super::{previously_ok, PassEnv, PassReport, ASSOCIATIONS_INPUT};

pub const PASS: &str = "links";

/// Audit logs of one batch.
struct Batch {
    space: String,
    tickets: Vec<TicketRow>,
    comments: Vec<CommentRow>,
}

fn load_batch(batch: &BatchConfig, current: bool) -> Result<Option<Batch>> {
    let tickets_path = batch.output_dir.join(audit::TICKETS_LOG);
    let tickets: Vec<TicketRow> = if current {
        tables::read_required_table(&tickets_path, "tickets")?
    } else {
        tables::read_optional_table(&tickets_path)?
    };
    if tickets.is_empty() && !current {
        tracing::warn!(space = %batch.space, dir = %batch.output_dir.display(), "batch has no migrated tickets");
        return Ok(None);
    }
    let comments: Vec<CommentRow> =
        tables::read_optional_table(&batch.output_dir.join(audit::COMMENTS_LOG))?;
    Ok(Some(Batch {
        space: batch.space.clone(),
        tickets: tickets.into_iter().filter(|r| audit::is_ok(&r.result)).collect(),
        comments: comments.into_iter().filter(|r| audit::is_ok(&r.result)).collect(),
    }))
}

/// Every batch merged into one map, plus the target key of every migrated
/// source ticket id across batches.
fn global_map(batches: &[Batch]) -> (GlobalIdMap, HashMap<String, String>) {
    let mut global = GlobalIdMap::new();
    let mut keys = HashMap::new();
    for batch in batches {
        let mut ids = IdentifierMap::new();
        audit::load_ticket_map(&batch.tickets, &mut ids);
        audit::load_comment_map(&batch.comments, &mut ids);
        for row in &batch.tickets {
            keys.entry(row.assembla_ticket_id.clone())
                .or_insert_with(|| row.jira_ticket_key.clone());
        }
        global.add_batch(batch.space.clone(), ids);
    }
    for conflict in global.conflicts() {
        tracing::warn!("{}", conflict);
    }
    (global, keys)
}

/// One record the pass attempts, in counter order.
enum Item<'a> {
    Description(&'a TicketRow),
    Comment(&'a CommentRow),
    Association(&'a SourceAssociation),
}

fn content_key(ticket_key: &str, comment_id: &str) -> String {
    format!("{}#{}", ticket_key, comment_id)
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config: &Config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let mut batches = Vec::new();
    let mut current = None;
    for batch in config.link_batches() {
        let is_current = batch.space == config.source.space;
        if let Some(loaded) = load_batch(&batch, is_current)? {
            if is_current {
                current = Some(batches.len());
            }
            batches.push(loaded);
        }
    }
    let Some(current) = current else {
        anyhow::bail!(
            "Space '{}' is not listed in [[batches]]",
            config.source.space
        );
    };
    let (global, keys) = global_map(&batches);
    tracing::info!(batches = batches.len(), "identifier maps merged");

    let spaces: Vec<SourceSpace> = match &config.source.spaces_table {
        Some(path) => tables::read_table(path)
            .with_context(|| format!("Failed to read spaces table: {}", path.display()))?,
        None => Vec::new(),
    };
    let resolver_spaces = SpaceResolver::new(batches.iter().map(|b| b.space.clone()), &spaces);
    let repos = audit::load_repos(config.repos.table.as_deref())?;
    let links = LinkTemplates::new(
        config.target.base_url.clone(),
        config.links.browse_issue.clone(),
        config.links.browse_comment.clone(),
    );
    let mut resolver = CrossReferenceResolver::new(
        &global,
        resolver_spaces,
        &repos,
        &links,
        config.repos.url_template.clone(),
    )
    .context("Failed to compile link patterns")?;

    let this = &batches[current];
    let local: HashSet<&str> = this
        .tickets
        .iter()
        .map(|t| t.assembla_ticket_id.as_str())
        .collect();
    let associations: Vec<SourceAssociation> =
        tables::read_optional_table(&config.input(ASSOCIATIONS_INPUT))?;
    let external: Vec<&SourceAssociation> = associations
        .iter()
        .filter(|a| {
            let one = local.contains(a.ticket1_id.as_str());
            let two = local.contains(a.ticket2_id.as_str());
            (one || two)
                && !(one && two)
                && keys.contains_key(&a.ticket1_id)
                && keys.contains_key(&a.ticket2_id)
        })
        .collect();
    let link_types = check_link_types(
        &config.associations,
        external.iter().copied(),
        env.api.list_link_types().await?,
    )?;

    let updated_before: Vec<ContentUpdateRow> =
        tables::read_optional_table(&config.output(audit::LINKS_UPDATED))?;
    let updated: HashSet<String> = updated_before
        .iter()
        .filter(|r| audit::is_ok(&r.result))
        .map(|r| content_key(&r.jira_ticket_key, &r.jira_comment_id))
        .collect();
    let linked_before: Vec<AssociationRow> =
        tables::read_optional_table(&config.output(audit::ASSOCIATIONS_EXT_LOG))?;
    let linked = previously_ok(&linked_before, |r| &r.result, |r| &r.assembla_association_id);

    let items: Vec<Item> = this
        .tickets
        .iter()
        .map(Item::Description)
        .chain(this.comments.iter().map(Item::Comment))
        .chain(external.iter().copied().map(Item::Association))
        .collect();

    let window = env.window(PASS).await?;
    let mut all_log = env.audit(audit::LINKS_ALL)?;
    let mut updated_log = env.audit(audit::LINKS_UPDATED)?;
    let mut assoc_log = env.audit(audit::ASSOCIATIONS_EXT_LOG)?;
    let mut misses = LinkMisses::default();
    let mut references = 0u64;
    let total = items.len() as u64;

    for (i, item) in items.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        env.processing(PASS, counter, total);

        let (ticket_key, ticket_id, comment_id, content) = match item {
            Item::Description(t) => (&t.jira_ticket_key, &t.jira_ticket_id, "", &t.description),
            Item::Comment(c) => (
                &c.jira_ticket_key,
                &c.jira_ticket_id,
                c.jira_comment_id.as_str(),
                &c.body,
            ),
            Item::Association(a) => {
                let inward = &keys[&a.ticket1_id];
                let outward = &keys[&a.ticket2_id];
                let Some(link_type) = link_type_for(&config.associations, &a.relationship_name)
                    .and_then(|name| link_types.get(&name.to_lowercase()).cloned())
                else {
                    report.record_skip();
                    env.advance(PASS, counter).await?;
                    continue;
                };
                if linked.contains(&a.id) {
                    report.record_skip();
                    env.advance(PASS, counter).await?;
                    continue;
                }
                if env.opts.dry_run {
                    env.intend(format_args!("link {} '{}' {}", inward, link_type, outward));
                    report.record_ok();
                    continue;
                }
                let mut request = LinkRequest {
                    link_type: link_type.clone(),
                    inward: inward.clone(),
                    outward: outward.clone(),
                };
                let outcome = create_with_repair(env.api, &mut request, ctx).await;
                match &outcome.result {
                    Ok(()) => report.record_ok(),
                    Err(failure) => report.record_nok(&failure.message),
                }
                assoc_log.write(&AssociationRow {
                    result: outcome.status().into(),
                    message: outcome.message(),
                    assembla_association_id: a.id.clone(),
                    relationship_name: a.relationship_name.clone(),
                    link_type,
                    inward_key: inward.clone(),
                    outward_key: outward.clone(),
                    counter,
                    run_id: env.run_id.to_string(),
                })?;
                env.advance(PASS, counter).await?;
                report.attempted(counter);
                continue;
            }
        };

        if updated.contains(&content_key(ticket_key, comment_id)) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        let resolution = resolver.resolve(content);
        misses.record(&resolution.warnings);
        ctx.record_warnings(&resolution.warnings);
        for r in &resolution.references {
            references += 1;
            all_log.write(&ExternalLinkRow {
                space: this.space.clone(),
                jira_ticket_key: ticket_key.clone(),
                jira_comment_id: comment_id.to_string(),
                kind: r.kind.as_str().into(),
                target_space: r.space.clone(),
                record: match &r.comment {
                    Some(c) => format!("{}?comment={}", r.record, c),
                    None => r.record.clone(),
                },
                original: r.original.clone(),
                resolved_url: r.resolved_url.clone().unwrap_or_default(),
            })?;
        }
        if !resolution.changed() {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        if env.opts.dry_run {
            let resolved = resolution
                .references
                .iter()
                .filter(|r| r.resolved_url.is_some())
                .count();
            if comment_id.is_empty() {
                env.intend(format_args!("update description of {} ({} links)", ticket_key, resolved));
            } else {
                env.intend(format_args!(
                    "update comment {} on {} ({} links)",
                    comment_id, ticket_key, resolved
                ));
            }
            report.record_ok();
            continue;
        }

        let mut request = if comment_id.is_empty() {
            ContentUpdate::Description {
                issue: ticket_id.clone(),
                text: resolution.text.clone(),
            }
        } else {
            ContentUpdate::Comment {
                issue: ticket_id.clone(),
                comment_id: comment_id.to_string(),
                text: resolution.text.clone(),
            }
        };
        let outcome = create_with_repair(env.api, &mut request, ctx).await;
        match &outcome.result {
            Ok(()) => report.record_ok(),
            Err(failure) => report.record_nok(&failure.message),
        }
        updated_log.write(&ContentUpdateRow {
            result: outcome.status().into(),
            message: outcome.message(),
            space: this.space.clone(),
            jira_ticket_key: ticket_key.clone(),
            jira_comment_id: comment_id.to_string(),
            before: content.clone(),
            after: resolution.text,
            counter,
            run_id: env.run_id.to_string(),
        })?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("references found", references);
    report.count("external associations", external.len() as u64);
    for (label, n) in misses.counts() {
        report.count(label, n as u64);
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

    const HEADER: &str = "Assembla ticket [#1|https://app.assembla.com/spaces/europeana-apis/tickets/1]";

    /// Two spaces migrated into the same target project; the second one
    /// is known by its wiki name in URLs.
    fn setup(tmp: &TempDir) -> Config {
        let other = tmp.path().join("core");
        std::fs::create_dir_all(&other).unwrap();
        let spaces = tmp.path().join("spaces.csv");
        testing::write(&spaces, "id,name,wiki_name\nsp2,Europeana Core,europeana-core\n");
        let mut config = testing::config(
            tmp,
            &format!(
                "\n[[batches]]\nspace = \"Europeana APIs\"\nkey = \"EA\"\noutput_dir = \"{out}\"\n\n\
                 [[batches]]\nspace = \"Europeana Core\"\nkey = \"EA\"\noutput_dir = \"{core}\"\n",
                out = tmp.path().join("out").display(),
                core = other.display()
            ),
        );
        config.source.spaces_table = Some(spaces);

        let description = format!(
            "{}\n\nSee https://app.assembla.com/spaces/europeana-core/tickets/5-crash and \
             https://app.assembla.com/spaces/unknown-space/tickets/9",
            HEADER
        );
        let mut writer = tables::TableWriter::create(&config.output(audit::TICKETS_LOG)).unwrap();
        writer
            .write(&TicketRow {
                result: "OK".into(),
                jira_ticket_id: "10001".into(),
                jira_ticket_key: "EA-1".into(),
                assembla_ticket_id: "t1".into(),
                assembla_ticket_number: "1".into(),
                description,
                ..TicketRow::default()
            })
            .unwrap();
        drop(writer);
        let mut writer = tables::TableWriter::create(&config.output(audit::COMMENTS_LOG)).unwrap();
        writer
            .write(&CommentRow {
                result: "OK".into(),
                jira_comment_id: "10003".into(),
                jira_ticket_id: "10001".into(),
                jira_ticket_key: "EA-1".into(),
                assembla_comment_id: "c1".into(),
                body: "Assembla | Author x | Created on 2014-01-01 00:00\n\n\
                       see https://app.assembla.com/spaces/europeana-core/tickets/5?comment=77#comment:77"
                    .into(),
                ..CommentRow::default()
            })
            .unwrap();
        drop(writer);

        testing::write(
            &other.join(audit::TICKETS_LOG),
            "result,jira_ticket_id,jira_ticket_key,assembla_ticket_id,assembla_ticket_number\nOK,10002,EA-2,x5,5\n",
        );
        testing::write(
            &other.join(audit::COMMENTS_LOG),
            "result,jira_comment_id,jira_ticket_id,jira_ticket_key,assembla_comment_id\nOK,555,10002,EA-2,77\n",
        );
        testing::write(
            &config.input(ASSOCIATIONS_INPUT),
            "id,ticket1_id,ticket2_id,relationship_name\na1,t1,x5,related\na2,t1,x5,parent\n",
        );
        config
    }

    async fn target() -> InMemoryTarget {
        let target = InMemoryTarget::new("EA");
        for summary in ["one", "five"] {
            target
                .create_issue(&IssueFields {
                    summary: summary.into(),
                    issue_type: "Task".into(),
                    ..IssueFields::default()
                })
                .await
                .unwrap();
        }
        target.create_comment("EA-1", "original").await.unwrap();
        target
    }

    #[tokio::test]
    async fn test_rewrites_cross_batch_references() {
        let tmp = TempDir::new().unwrap();
        let config = setup(&tmp);
        let pool = testing::memory_pool().await;
        let target = target().await;
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 3);
        assert_eq!(report.skipped, 1);
        assert!(report
            .counters()
            .contains(&("missing projects".to_string(), 1)));

        let issue = &target.issues()[0];
        assert!(issue
            .fields
            .description
            .contains("See https://example.atlassian.net/browse/EA-2 and"));
        assert!(issue
            .fields
            .description
            .ends_with("https://app.assembla.com/spaces/unknown-space/tickets/9"));
        assert!(issue.fields.description.starts_with(HEADER));
        assert!(target.comments()[0]
            .body
            .contains("https://example.atlassian.net/browse/EA-2?focusedCommentId=555"));
        assert_eq!(
            target.links(),
            vec![("Relates".to_string(), "EA-1".to_string(), "EA-2".to_string())]
        );

        let all: Vec<ExternalLinkRow> = tables::read_table(&config.output(audit::LINKS_ALL)).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].kind, "comment");
        assert_eq!(all[2].record, "5?comment=77");

        // Updated content and linked associations are not touched again.
        let again = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(again.ok, 0);
        assert_eq!(target.calls("update_issue"), 1);
        assert_eq!(target.calls("create_link"), 1);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = setup(&tmp);
        let pool = testing::memory_pool().await;
        let target = target().await;
        let opts = PassOptions {
            dry_run: true,
            ..PassOptions::default()
        };
        let env = testing::env(&config, &target, &pool, opts);

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 3);
        assert_eq!(target.calls("update_issue"), 0);
        assert_eq!(target.calls("update_comment"), 0);
        assert!(target.links().is_empty());
        assert!(!config.output(audit::LINKS_UPDATED).exists());
    }
}
