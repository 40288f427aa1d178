pub mod config_store;
pub mod connection_manager;
pub mod favorites;
pub mod notifications;
pub mod platform;
pub mod profiles;
pub mod query_executor;
pub mod query_history;
pub mod schema_cache;
pub mod session_store;
pub mod statements;
pub mod workbench;
