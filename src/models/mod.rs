//! Core data models for the upload coordinator.
//!
//! These entities mirror the `uploads` and `parts` ledger tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod part;
pub mod upload;
