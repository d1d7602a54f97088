//! Configuration module for the IPTV stream validator
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
