//! `agentry` Core Library
//!
//! Shared functionality for the agentry daemon:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Write-scope glob matching
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod scope;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use scope::WriteScope;
