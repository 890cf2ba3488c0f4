//! agentry daemon library
//!
//! Supervises coding-agent processes in isolated git worktrees:
//! - SQLite storage for tasks, runs and their records
//! - Task status derivation from runs and dependencies
//! - Worktree provisioning per run
//! - Runner adapters (Claude Code, Codex) and the runner manager
//! - Run lifecycle coordination and the in-process event bus

pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod runner;
pub mod status;
pub mod storage;
pub mod subscribers;
pub mod worktree;

pub use orchestrator::Orchestrator;
