//! # ticket-migrate CLI (`tmig`)
//!
//! ## Usage
//!
//! ```bash
//! tmig --config ./config/tmig.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tmig init` | Create the state database and run schema migrations |
//! | `tmig sources` | List the export tables and their row counts |
//! | `tmig stats` | OK/NOK counts per audit log with grouped failures |
//! | `tmig run <pass>` | Run one pass |
//! | `tmig run all` | Run every pass in dependency order |
//!
//! ## Examples
//!
//! ```bash
//! # Preview the tickets pass
//! tmig run tickets --dry-run
//!
//! # Continue an interrupted comments pass
//! tmig run comments --resume
//!
//! # Retry a window of 50 tickets starting at the 200th
//! tmig run tickets --offset 200 --limit 50
//!
//! # Rewrite links once every space has been migrated
//! tmig run links
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ticket_migrate::driver::MigrationDriver;
use ticket_migrate::jira::JiraClient;
use ticket_migrate::passes::PassOptions;
use ticket_migrate::progress::ProgressMode;
use ticket_migrate::{config, db, logging, migrate, sources, stats};

/// Migrate an Assembla space into a Jira project.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tmig.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tmig",
    about = "Migrate an Assembla space into a Jira project",
    version,
    long_about = "Reads the Assembla CSV export and recreates users, custom fields, tickets, \
    comments, statuses, watchers and associations in Jira, one pass at a time. Every pass \
    writes an append-only audit log and can be resumed."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tmig.toml")]
    config: PathBuf,

    /// Debug-level diagnostics on stderr (`RUST_LOG` overrides).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr. Defaults to `human` on a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database.
    ///
    /// Creates the SQLite file holding checkpoints and the run journal.
    /// Safe to run more than once.
    Init,

    /// List the export tables the passes read, with row counts.
    Sources,

    /// Show OK/NOK counts per audit log and the failures grouped by message.
    Stats {
        /// Only the logs written by this pass.
        #[arg(long)]
        pass: Option<String>,
    },

    /// Run a migration pass.
    ///
    /// Passes: projects, fields, users, tickets, comments, statuses,
    /// watchers, associations, links, or `all` for every pass in that order.
    Run {
        /// Pass name or `all`.
        pass: String,

        /// Compute and print every change without calling the Jira API
        /// mutations or writing audit logs. Single passes only.
        #[arg(long)]
        dry_run: bool,

        /// 1-based position of the first record to attempt.
        #[arg(long)]
        offset: Option<u64>,

        /// Maximum number of records to attempt.
        #[arg(long)]
        limit: Option<u64>,

        /// Start after the last record the pass attempted.
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("State database initialized: {}", cfg.output.state_db.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Stats { pass } => {
            stats::run_stats(&cfg, pass.as_deref()).await?;
        }
        Commands::Run {
            pass,
            dry_run,
            offset,
            limit,
            resume,
        } => {
            let opts = PassOptions {
                dry_run,
                offset,
                limit,
                resume,
            };
            let progress = cli
                .progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            let api = JiraClient::from_config(&cfg.target)?;
            let pool = db::connect(&cfg).await?;
            migrate::create_schema(&pool).await?;

            let mut driver = MigrationDriver::new(&cfg, &api, &pool, progress.as_ref());
            tracing::info!(run_id = driver.run_id(), space = %cfg.source.space, "run started");
            let result = driver.run(&pass, opts).await;
            pool.close().await;
            result?;
        }
    }

    Ok(())
}
