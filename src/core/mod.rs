//! Core functionality: error types, configuration, and shared data structures.

pub mod config;
pub mod error;
pub mod types;
