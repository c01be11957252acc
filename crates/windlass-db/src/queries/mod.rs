//! Query functions, one module per logical table.

pub mod outbox;
pub mod tasks;
pub mod workflows;
pub mod world;
