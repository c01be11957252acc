//! SQLite persistence layer for the windlass workflow kernel.
//!
//! Holds the connection pool, schema migrations, row models, and query
//! functions for the four logical tables: `workflow_state`, `task_state`,
//! `outbox`, and `world_state` (+ its version history).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
