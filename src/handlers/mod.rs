pub mod health_handlers;
pub mod ledger_handlers;
pub mod project_handlers;
pub mod session_handlers;
