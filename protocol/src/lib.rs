//! Common types shared between the vthook engine and its configuration.

pub mod config;
pub mod error;
pub mod hook;

pub use config::EngineConfig;
pub use error::ConfigError;
pub use hook::*;
