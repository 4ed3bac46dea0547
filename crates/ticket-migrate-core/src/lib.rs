//! # ticket-migrate core
//!
//! The record migration engine: identifier maps, content rewriting,
//! cross-reference resolution, and the create-with-repair protocol against
//! an abstract target tracker.
//!
//! This crate performs no filesystem or network I/O. The `ticket-migrate`
//! binary crate supplies the tabular loaders, the HTTP client, and the
//! pass orchestration.

pub mod context;
pub mod creator;
pub mod idmap;
pub mod models;
pub mod repair;
pub mod report;
pub mod rewrite;
mod segment;
pub mod target;
pub mod xref;
