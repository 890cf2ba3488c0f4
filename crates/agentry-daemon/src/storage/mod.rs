//! `SQLite` storage for the agentry daemon.
//!
//! Provides persistence for projects, tasks, agent profiles, runs and their
//! check / scope-violation child records, and project memory.

mod db;
mod models;
mod queries;
mod queries_runs;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::NewAgentProfile;
