//! Pass orchestration.
//!
//! [`MigrationDriver`] runs one named pass, or every pass in
//! [`PASS_ORDER`], against a single [`RunContext`] so identities rejected
//! by one pass are substituted up front by the next. Each invocation is
//! journaled in the `runs` table; a pass that returns an error leaves its
//! journal row unfinished and stops the run.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::target::TargetApi;

use crate::checkpoint;
use crate::config::Config;
use crate::passes::{self, PassEnv, PassOptions, PassReport, PASS_ORDER};
use crate::progress::PassProgressReporter;

pub struct MigrationDriver<'a> {
    config: &'a Config,
    api: &'a dyn TargetApi,
    pool: &'a SqlitePool,
    progress: &'a dyn PassProgressReporter,
    run_id: String,
    ctx: RunContext,
}

impl<'a> MigrationDriver<'a> {
    pub fn new(
        config: &'a Config,
        api: &'a dyn TargetApi,
        pool: &'a SqlitePool,
        progress: &'a dyn PassProgressReporter,
    ) -> Self {
        Self {
            config,
            api,
            pool,
            progress,
            run_id: uuid::Uuid::new_v4().to_string(),
            ctx: RunContext::new(config.accounts.fallback_account_id.clone()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run `target`: a pass name or `all`.
    pub async fn run(&mut self, target: &str, opts: PassOptions) -> Result<Vec<PassReport>> {
        let reports = if target == "all" {
            if opts.offset.is_some() || opts.limit.is_some() {
                bail!("--offset and --limit apply to a single pass, not 'all'");
            }
            // Later passes read the audit logs of earlier ones, which a dry
            // run never writes.
            if opts.dry_run {
                bail!("--dry-run applies to a single pass, not 'all'; dry-run each pass after running the ones before it");
            }
            let mut reports = Vec::with_capacity(PASS_ORDER.len());
            for pass in PASS_ORDER {
                reports.push(self.run_pass(pass, opts).await?);
            }
            reports
        } else {
            vec![self.run_pass(target, opts).await?]
        };
        self.print_warnings();
        Ok(reports)
    }

    pub async fn run_pass(&mut self, pass: &str, opts: PassOptions) -> Result<PassReport> {
        if !PASS_ORDER.contains(&pass) {
            bail!(
                "Unknown pass '{}'. Expected one of: {}, all",
                pass,
                PASS_ORDER.join(", ")
            );
        }
        let space = self.config.source.space.as_str();
        checkpoint::start_run(self.pool, &self.run_id, pass, space, opts.dry_run).await?;
        tracing::info!(pass, run_id = %self.run_id, dry_run = opts.dry_run, "pass started");

        let env = PassEnv {
            config: self.config,
            api: self.api,
            pool: self.pool,
            progress: self.progress,
            run_id: &self.run_id,
            opts,
        };
        let ctx = &mut self.ctx;
        let report = match pass {
            "projects" => passes::projects::run(&env, ctx).await,
            "fields" => passes::fields::run(&env, ctx).await,
            "users" => passes::users::run(&env, ctx).await,
            "tickets" => passes::tickets::run(&env, ctx).await,
            "comments" => passes::comments::run(&env, ctx).await,
            "statuses" => passes::statuses::run(&env, ctx).await,
            "watchers" => passes::watchers::run(&env, ctx).await,
            "associations" => passes::associations::run(&env, ctx).await,
            "links" => passes::links::run(&env, ctx).await,
            other => bail!("Unknown pass '{}'", other),
        }
        .with_context(|| format!("Pass '{}' failed", pass))?;

        checkpoint::finish_run(self.pool, &self.run_id, pass, report.ok, report.nok).await?;
        tracing::info!(pass, ok = report.ok, nok = report.nok, skipped = report.skipped, "pass finished");
        Ok(report)
    }

    /// Distinct unresolved references and mentions seen during the run.
    fn print_warnings(&self) {
        let warnings = &self.ctx.warnings;
        if warnings.distinct() == 0 {
            return;
        }
        println!("warnings: {} distinct, {} total", warnings.distinct(), warnings.total());
        for (kind, n) in warnings.by_kind() {
            println!("  unresolved {}: {}", kind.as_str(), n);
        }
    }
}
