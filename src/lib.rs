pub mod config;
pub mod control;
pub mod fetcher;
pub mod models;
pub mod monitor;
pub mod notifications;
pub mod proxy_pool;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod web;

// Re-export commonly used types
pub use config::AppConfig;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
