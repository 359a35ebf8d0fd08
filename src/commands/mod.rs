//! Command implementations for the CLI
//!
//! This module contains the implementation of all CLI commands:
//! - serve: Start the APM server
//! - config: Configuration display and validation

pub mod config;
pub mod serve;
