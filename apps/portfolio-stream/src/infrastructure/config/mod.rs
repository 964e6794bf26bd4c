//! Configuration Module
//!
//! Environment-driven configuration for the portfolio stream service.

pub mod settings;

pub use settings::{ConfigError, ConnectionSettings, PipelineSettings, ServiceConfig};
