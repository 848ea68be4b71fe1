//! Core services: the path guard, upload sessions, both ledgers and the
//! sync engine with its transports.

pub mod binding_store;
pub mod equity_ledger;
pub mod git_transport;
pub mod ledger;
pub mod path_guard;
pub mod project_service;
pub mod rest_transport;
pub mod session_store;
pub mod share_ledger;
pub mod sync_engine;
pub mod transport;
