#![forbid(unsafe_code)]

//! # wpfleet
//!
//! The engine behind the `wpfleet` CLI. Rolls WordPress plugin updates out
//! across a fleet of sites over ssh, one finite batch ("run") at a time:
//!
//! - Planning: sites × plugins, filters, and retry selection from history
//! - Remote execution over the system `ssh`/`scp`, with a line-based marker
//!   protocol for reading results back
//! - Bounded-parallel dispatch with per-task timeouts
//! - A SQLite run log and CSV/Markdown reports

pub mod config;
pub mod coordinator;
pub mod executor;
pub mod log;
pub mod plan;
pub mod protocol;
pub mod report;
pub mod run;
pub mod store;
