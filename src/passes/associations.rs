//! Link tickets that were associated in the source space.
//!
//! Only associations between two tickets of this batch are handled here;
//! the links pass picks up the ones that cross batches.

use std::collections::HashMap;

use anyhow::{bail, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, LinkRequest};
use ticket_migrate_core::idmap::IdentifierMap;
use ticket_migrate_core::models::{NamedId, SourceAssociation};

use crate::audit::{self, AssociationRow, TicketRow};
use crate::config::AssociationsConfig;
use crate::tables;

use super::{migrated_tickets, previously_ok, PassEnv, PassReport, ASSOCIATIONS_INPUT};

pub const PASS: &str = "associations";

/// `related` → `Related`, `BLOCK` → `Block`.
fn capitalize(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Link type for a source relationship name, or `None` when relationships
/// of this kind are not linked.
pub fn link_type_for(config: &AssociationsConfig, relationship: &str) -> Option<String> {
    let first_word = relationship.split_whitespace().next()?;
    if config
        .skip
        .iter()
        .any(|s| s.eq_ignore_ascii_case(first_word))
    {
        return None;
    }
    let name = capitalize(relationship);
    Some(config.rename.get(&name).cloned().unwrap_or(name))
}

/// Target link type names by lowercase name; a link type the associations
/// need but the target lacks is fatal.
pub fn check_link_types<'a>(
    config: &AssociationsConfig,
    associations: impl IntoIterator<Item = &'a SourceAssociation>,
    target: Vec<NamedId>,
) -> Result<HashMap<String, String>> {
    let known: HashMap<String, String> = target
        .into_iter()
        .map(|t| (t.name.to_lowercase(), t.name))
        .collect();
    let mut missing: Vec<String> = associations
        .into_iter()
        .filter_map(|a| link_type_for(config, &a.relationship_name))
        .filter(|name| !known.contains_key(&name.to_lowercase()))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    if !missing.is_empty() {
        bail!(
            "Link types do not exist on the target: {} (create them or add an [associations] rename)",
            missing.join(", ")
        );
    }
    Ok(known)
}

fn local_pair<'t>(
    tickets: &'t HashMap<String, TicketRow>,
    association: &SourceAssociation,
) -> Option<(&'t TicketRow, &'t TicketRow)> {
    Some((
        tickets.get(&association.ticket1_id)?,
        tickets.get(&association.ticket2_id)?,
    ))
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let mut ids = IdentifierMap::new();
    let tickets = migrated_tickets(config, &mut ids)?;
    let associations: Vec<SourceAssociation> =
        tables::read_optional_table(&config.input(ASSOCIATIONS_INPUT))?;
    let local: Vec<&SourceAssociation> = associations
        .iter()
        .filter(|a| local_pair(&tickets, a).is_some())
        .collect();
    tracing::info!(
        total = associations.len(),
        local = local.len(),
        "associations loaded"
    );
    let link_types = check_link_types(
        &config.associations,
        local.iter().copied(),
        env.api.list_link_types().await?,
    )?;

    let previous: Vec<AssociationRow> =
        tables::read_optional_table(&config.output(audit::ASSOCIATIONS_LOG))?;
    let done = previously_ok(&previous, |r| &r.result, |r| &r.assembla_association_id);

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::ASSOCIATIONS_LOG)?;
    let total = local.len() as u64;
    let mut by_type: HashMap<String, u64> = HashMap::new();

    for (i, association) in local.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        env.processing(PASS, counter, total);
        let Some((inward, outward)) = local_pair(&tickets, association) else {
            continue;
        };
        let Some(link_type) = link_type_for(&config.associations, &association.relationship_name)
            .and_then(|name| link_types.get(&name.to_lowercase()).cloned())
        else {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        };
        if done.contains(&association.id) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        if env.opts.dry_run {
            env.intend(format_args!(
                "link {} '{}' {}",
                inward.jira_ticket_key, link_type, outward.jira_ticket_key
            ));
            report.record_ok();
            continue;
        }

        let mut request = LinkRequest {
            link_type: link_type.clone(),
            inward: inward.jira_ticket_key.clone(),
            outward: outward.jira_ticket_key.clone(),
        };
        let outcome = create_with_repair(env.api, &mut request, ctx).await;
        match &outcome.result {
            Ok(()) => {
                *by_type.entry(link_type.clone()).or_insert(0) += 1;
                report.record_ok();
            }
            Err(failure) => report.record_nok(&failure.message),
        }
        log.write(&AssociationRow {
            result: outcome.status().into(),
            message: outcome.message(),
            assembla_association_id: association.id.clone(),
            relationship_name: association.relationship_name.clone(),
            link_type,
            inward_key: inward.jira_ticket_key.clone(),
            outward_key: outward.jira_ticket_key.clone(),
            counter,
            run_id: env.run_id.to_string(),
        })?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    let mut by_type: Vec<_> = by_type.into_iter().collect();
    by_type.sort();
    for (name, n) in by_type {
        report.count(format!("linked '{}'", name), n);
    }
    report.print();
    Ok(report)
}
