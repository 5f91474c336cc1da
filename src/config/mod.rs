/// Application configuration loading from config.toml
pub mod app;

/// Database configuration and connection management
pub mod database;

/// Bootstrap owner account from environment variables
pub mod owner;

pub use app::{AppConfig, load_config, load_or_default};
