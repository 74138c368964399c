//! Lineage Core Library
//!
//! Shared functionality for Lineage components:
//! - Settings resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Settings;
pub use error::{Error, Result};
