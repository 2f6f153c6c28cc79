pub mod check_runner;
pub mod config;
pub mod tasks;

pub use check_runner::{CheckOutcome, LocalCheckRunner};
pub use config::{AppConfig, ConfigError};
pub use tasks::RetentionTask;
