//! Configuration module for the VK Video batch downloader
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the merged result.

pub mod config;

pub use config::*;
