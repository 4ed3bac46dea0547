//! Ensure the custom fields the tickets pass fills in exist on the target.
//!
//! Two groups: provenance fields (`Assembla-Id`, `Assembla-Status`, ...)
//! that keep the original values searchable, and one field per source
//! custom field, created with the plugin type matching the source type.

use std::collections::HashSet;

use anyhow::{bail, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::creator::{create_with_repair, CustomFieldRequest};
use ticket_migrate_core::models::{NewCustomField, SourceCustomField};

use crate::audit::{self, CustomFieldRow};
use crate::tables;

use super::{PassEnv, PassReport, CUSTOM_FIELDS_INPUT};

pub const PASS: &str = "fields";

/// Provenance field suffixes and their plugin types.
pub const PROVENANCE_FIELDS: &[(&str, &str)] = &[
    ("Id", "textfield"),
    ("Number", "float"),
    ("Created-On", "datetime"),
    ("Due-Date", "datetime"),
    ("Reporter", "textfield"),
    ("Assignee", "textfield"),
    ("Status", "textfield"),
    ("Milestone", "textfield"),
    ("Completed", "datetime"),
    ("Estimate", "textfield"),
    ("Worked", "float"),
    ("Remaining", "float"),
    ("Importance", "float"),
];

pub fn provenance_name(prefix: &str, suffix: &str) -> String {
    format!("{}-{}", prefix, suffix)
}

/// Target plugin type for a source custom field type.
pub fn plugin_kind(source_type: &str) -> Option<&'static str> {
    match source_type.trim() {
        "Text" => Some("textfield"),
        "List" => Some("select"),
        "Checkbox" => Some("radiobuttons"),
        "Numeric" => Some("float"),
        "Date" | "Date Time" => Some("datetime"),
        "Team List" => Some("userpicker"),
        _ => None,
    }
}

struct Wanted {
    field: NewCustomField,
    source_id: String,
}

/// Every field the tickets pass needs, provenance fields first.
fn wanted_fields(prefix: &str, source: &[SourceCustomField]) -> Result<Vec<Wanted>> {
    let mut wanted: Vec<Wanted> = PROVENANCE_FIELDS
        .iter()
        .map(|(suffix, kind)| Wanted {
            field: NewCustomField {
                name: provenance_name(prefix, suffix),
                description: format!("Original {} of the migrated Assembla ticket", suffix.to_lowercase()),
                kind: kind.to_string(),
            },
            source_id: String::new(),
        })
        .collect();
    for field in source {
        let Some(kind) = plugin_kind(&field.field_type) else {
            bail!(
                "Custom field '{}' has unsupported type '{}'",
                field.title,
                field.field_type
            );
        };
        wanted.push(Wanted {
            field: NewCustomField {
                name: field.title.clone(),
                description: format!(
                    "Assembla custom field '{}' of type '{}'",
                    field.title, field.field_type
                ),
                kind: kind.to_string(),
            },
            source_id: field.id.clone(),
        });
    }
    Ok(wanted)
}

pub async fn run(env: &PassEnv<'_>, ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let source: Vec<SourceCustomField> =
        tables::read_optional_table(&config.input(CUSTOM_FIELDS_INPUT))?;
    let wanted = wanted_fields(&config.tickets.custom_field_prefix, &source)?;
    let existing: HashSet<String> = env
        .api
        .list_fields()
        .await?
        .into_iter()
        .map(|f| f.name)
        .collect();

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::FIELDS_LOG)?;
    let total = wanted.len() as u64;
    let mut created = 0;

    for (i, item) in wanted.into_iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        env.processing(PASS, counter, total);
        let mut row = CustomFieldRow {
            name: item.field.name.clone(),
            kind: item.field.kind.clone(),
            assembla_field_id: item.source_id,
            ..CustomFieldRow::default()
        };

        if existing.contains(&item.field.name) {
            tracing::debug!(field = %item.field.name, "custom field exists");
            row.result = audit::OK.into();
            log.write(&row)?;
            report.record_skip();
        } else if env.opts.dry_run {
            env.intend(format_args!(
                "create custom field '{}' ({})",
                item.field.name, item.field.kind
            ));
            report.record_ok();
        } else {
            let mut request = CustomFieldRequest { field: item.field };
            let outcome = create_with_repair(env.api, &mut request, ctx).await;
            row.result = outcome.status().into();
            row.message = outcome.message();
            match &outcome.result {
                Ok(field) => {
                    row.field_id = field.id.clone();
                    row.created = true;
                    created += 1;
                    report.record_ok();
                }
                Err(failure) => report.record_nok(&failure.message),
            }
            log.write(&row)?;
        }
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("created fields", created);
    if source
        .iter()
        .any(|f| matches!(f.field_type.trim(), "List" | "Checkbox"))
    {
        tracing::warn!("list and checkbox fields need their options configured on the target");
    }
    report.print();
    Ok(report)
}
