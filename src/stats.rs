//! Audit log statistics.
//!
//! Reads the result logs back and prints OK/NOK counts per log, the NOK
//! records grouped by failure message, and the most recent pass runs.
//! Used by `tmig stats` to decide which failures need a fix before a
//! pass is re-run.

use std::path::PathBuf;

use anyhow::{bail, Result};

use ticket_migrate_core::report::FailureSummary;

use crate::audit::{self, ResultRow, RESULT_LOGS};
use crate::checkpoint;
use crate::config::Config;
use crate::db;
use crate::passes::PASS_ORDER;
use crate::tables;

/// Counts for one result log.
#[derive(Debug)]
pub struct LogStats {
    pub pass: &'static str,
    pub file: &'static str,
    pub path: PathBuf,
    /// `false` when the log has not been written yet.
    pub present: bool,
    pub ok: usize,
    pub nok: usize,
    pub failures: FailureSummary,
}

/// Read every result log, or only those written by `pass`.
pub fn collect(config: &Config, pass: Option<&str>) -> Result<Vec<LogStats>> {
    if let Some(name) = pass {
        if !PASS_ORDER.contains(&name) {
            bail!(
                "Unknown pass '{}'. Expected one of: {}",
                name,
                PASS_ORDER.join(", ")
            );
        }
    }

    let mut out = Vec::new();
    for &(log_pass, file) in RESULT_LOGS {
        if pass.is_some_and(|p| p != log_pass) {
            continue;
        }
        let path = config.output(file);
        let present = path.exists();
        let rows: Vec<ResultRow> = tables::read_optional_table(&path)?;
        let mut stats = LogStats {
            pass: log_pass,
            file,
            path,
            present,
            ok: 0,
            nok: 0,
            failures: FailureSummary::new(),
        };
        for row in &rows {
            if audit::is_ok(&row.result) {
                stats.ok += 1;
            } else {
                stats.nok += 1;
                stats.failures.add(&row.message);
            }
        }
        out.push(stats);
    }
    Ok(out)
}

/// Run the stats command: read the logs and print a summary.
pub async fn run_stats(config: &Config, pass: Option<&str>) -> Result<()> {
    let logs = collect(config, pass)?;

    println!("Migration stats: {}", config.source.space);
    println!("  Output: {}", config.output.dir.display());
    println!();
    println!("  {:<14} {:<40} {:>7} {:>7}", "PASS", "LOG", "OK", "NOK");
    println!("  {}", "-".repeat(71));
    for log in &logs {
        if log.present {
            println!("  {:<14} {:<40} {:>7} {:>7}", log.pass, log.file, log.ok, log.nok);
        } else {
            println!("  {:<14} {:<40} {:>7} {:>7}", log.pass, log.file, "-", "-");
        }
    }

    for log in logs.iter().filter(|l| !l.failures.is_empty()) {
        println!();
        println!("  {} failures ({}):", log.pass, log.file);
        for line in log.failures.render() {
            println!("  {}", line);
        }
    }

    if config.output.state_db.exists() {
        let pool = db::connect(config).await?;
        let runs = checkpoint::recent_runs(&pool, 10).await?;
        pool.close().await;
        let runs: Vec<_> = runs
            .into_iter()
            .filter(|r| pass.map_or(true, |p| r.pass == p))
            .collect();
        if !runs.is_empty() {
            println!();
            println!("  Recent runs:");
            println!(
                "  {:<14} {:>7} {:>7}   {:<16} {}",
                "PASS", "OK", "NOK", "STARTED", "RUN"
            );
            for r in &runs {
                let state = match (r.finished_at, r.dry_run != 0) {
                    (None, _) => " (interrupted)",
                    (Some(_), true) => " (dry-run)",
                    (Some(_), false) => "",
                };
                println!(
                    "  {:<14} {:>7} {:>7}   {:<16} {}{}",
                    r.pass,
                    r.ok,
                    r.nok,
                    format_ts_relative(r.started_at),
                    r.run_id,
                    state
                );
            }
        }
    }

    println!();
    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::testing;
    use tempfile::TempDir;

    #[test]
    fn test_counts_and_groups_failures() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        testing::write(
            &config.output(audit::TICKETS_LOG),
            "result,retries,message,assembla_ticket_id\n\
             OK,0,,t1\n\
             NOK,2,assignee: cannot be assigned issues,t2\n\
             NOK,2,assignee: cannot be assigned issues,t3\n\
             NOK,0,summary: too long,t4\n",
        );
        testing::write(
            &config.output(audit::COMMENTS_LOG),
            "result,message,assembla_comment_id\nOK,,c1\nOK,,c2\n",
        );

        let logs = collect(&config, None).unwrap();
        assert_eq!(logs.len(), RESULT_LOGS.len());
        let tickets = logs.iter().find(|l| l.file == audit::TICKETS_LOG).unwrap();
        assert!(tickets.present);
        assert_eq!((tickets.ok, tickets.nok), (1, 3));
        assert_eq!(
            tickets.failures.groups(),
            vec![
                ("assignee: cannot be assigned issues", 2),
                ("summary: too long", 1),
            ]
        );
        let users = logs.iter().find(|l| l.pass == "users").unwrap();
        assert!(!users.present);

        let only = collect(&config, Some("comments")).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].ok, 2);
        assert_eq!(collect(&config, Some("links")).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_pass() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        let err = collect(&config, Some("everything")).unwrap_err();
        assert!(err.to_string().contains("Unknown pass 'everything'"));
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
