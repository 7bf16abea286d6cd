//! Command implementations for the CLI
//!
//! - start: Run the exporter
//! - test: Validate configuration and metric definitions

pub mod start;
