pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;

// Re-exports for convenience
pub use database::PgRecordSink;
pub use handlers::AppState;
