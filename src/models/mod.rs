//! Core data models for the submission vault.
//!
//! Objects and submissions map to database tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`. Sessions live only in memory.

pub mod object;
pub mod session;
pub mod submission;
