//! Core data models for the equity ledgers and the workspace sync engine.
//!
//! Database-backed entities map to tables via `sqlx::FromRow`; session and
//! history records live as JSON on disk. Everything serializes via `serde`.

pub mod contribution;
pub mod equity;
pub mod ledger;
pub mod project;
pub mod session;
pub mod shares;
