//! # ticket-migrate
//!
//! Migrates an Assembla space into a Jira project from the Assembla CSV
//! export: users, custom fields, tickets, comments, statuses, watchers,
//! associations, and finally the links between spaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ CSV export  │──▶│    Passes    │──▶│  Jira REST   │
//! │ (input_dir) │   │rewrite+repair│   │  (TargetApi) │
//! └─────────────┘   └──────┬───────┘   └──────────────┘
//!                          │
//!               ┌──────────┴──────────┐
//!               ▼                     ▼
//!        ┌─────────────┐       ┌─────────────┐
//!        │ audit logs  │       │   SQLite    │
//!        │ (output.dir)│       │ checkpoints │
//!        └─────────────┘       └─────────────┘
//! ```
//!
//! Passes only talk to each other through the audit logs: the `tickets`
//! pass rebuilds its user map from `jira-users.csv`, the `links` pass
//! rebuilds a map of every batch from their `jira-tickets.csv` and
//! `jira-comments.csv`.
//!
//! ## Quick Start
//!
//! ```bash
//! tmig init                      # create the state database
//! tmig sources                   # check the export tables
//! tmig run projects --dry-run    # print what would be created
//! tmig run all
//! tmig stats                     # OK/NOK per log, failures grouped
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`tables`] | CSV reading and append-only writing |
//! | [`audit`] | Audit log rows and map loaders |
//! | [`jira`] | Jira REST client |
//! | [`passes`] | One module per migration pass |
//! | [`driver`] | Pass ordering and the run journal |
//! | [`checkpoint`] | Resume offsets |
//! | [`stats`] | Audit log statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod driver;
pub mod jira;
pub mod logging;
pub mod migrate;
pub mod passes;
pub mod progress;
pub mod sources;
pub mod stats;
pub mod tables;
