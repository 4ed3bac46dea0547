//! Find or create the target project.

use anyhow::{bail, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::models::{NamedId, NewProject};

use crate::audit::{self, ProjectRow};
use crate::config::Config;
use crate::tables;

use super::{PassEnv, PassReport};

pub const PASS: &str = "projects";

pub async fn run(env: &PassEnv<'_>, _ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let projects = env.api.list_projects().await?;
    let mut log = env.audit(audit::PROJECTS_LOG)?;

    if let Some(existing) = find_project(&projects, config) {
        tracing::info!(key = ?existing.key, id = %existing.id, "project already exists");
        log.write(&row(existing, false, ""))?;
        report.record_skip();
        report.count("existing project", 1);
        report.print();
        return Ok(report);
    }

    let project = NewProject {
        key: config.project.key.clone(),
        name: config.project.name.clone(),
        project_type: config.project.project_type.clone(),
        lead_account_id: config
            .project
            .lead_account_id
            .clone()
            .unwrap_or_else(|| config.accounts.admin_account_id.clone()),
        description: format!("Migrated from Assembla space '{}'", config.source.space),
    };

    if env.opts.dry_run {
        env.intend(format_args!("create project {} ({})", project.key, project.name));
        report.record_ok();
    } else {
        match env.api.create_project(&project).await {
            Ok(created) => {
                log.write(&row(&created, true, ""))?;
                report.record_ok();
            }
            Err(e) => {
                log.write(&ProjectRow {
                    result: audit::NOK.into(),
                    message: e.to_string(),
                    project_key: project.key.clone(),
                    name: project.name.clone(),
                    ..ProjectRow::default()
                })?;
                report.record_nok(&e.to_string());
            }
        }
    }
    env.processing(PASS, 1, 1);
    report.print();
    Ok(report)
}

fn find_project<'p>(projects: &'p [NamedId], config: &Config) -> Option<&'p NamedId> {
    projects.iter().find(|p| {
        p.key.as_deref() == Some(config.project.key.as_str())
            || p.name.eq_ignore_ascii_case(&config.project.name)
    })
}

fn row(project: &NamedId, created: bool, message: &str) -> ProjectRow {
    ProjectRow {
        result: audit::OK.into(),
        message: message.into(),
        project_id: project.id.clone(),
        project_key: project.key.clone().unwrap_or_default(),
        name: project.name.clone(),
        created,
    }
}

/// Id of the project recorded by this pass. Missing is fatal for the
/// passes that create records.
pub fn project_id(config: &Config) -> Result<String> {
    let rows: Vec<ProjectRow> =
        tables::read_required_table(&config.output(audit::PROJECTS_LOG), PASS)?;
    match rows
        .iter()
        .rev()
        .find(|r| audit::is_ok(&r.result) && r.project_key == config.project.key)
    {
        Some(row) => Ok(row.project_id.clone()),
        None => bail!(
            "Project {} is not in {} (run the '{}' pass first)",
            config.project.key,
            audit::PROJECTS_LOG,
            PASS
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::testing;
    use crate::passes::PassOptions;
    use tempfile::TempDir;
    use ticket_migrate_core::target::memory::InMemoryTarget;

    #[tokio::test]
    async fn test_creates_then_reuses_project() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        let env = testing::env(&config, &target, &pool, PassOptions::default());
        let mut ctx = RunContext::new("fallback");

        let first = run(&env, &mut ctx).await.unwrap();
        assert_eq!(first.ok, 1);
        let second = run(&env, &mut ctx).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(target.calls("create_project"), 1);

        let id = project_id(&config).unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        let opts = PassOptions {
            dry_run: true,
            ..PassOptions::default()
        };
        let env = testing::env(&config, &target, &pool, opts);

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(target.calls("create_project"), 0);
        assert!(project_id(&config).is_err());
    }
}
