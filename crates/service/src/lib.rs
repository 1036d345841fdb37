//! `fieldops-async`: runs the tenant event processor next to a health server.

pub mod app;
pub mod config;
pub mod health;
pub mod orchestrator;

pub use config::{ConfigError, ServiceConfig};
pub use orchestrator::TaskGroup;
