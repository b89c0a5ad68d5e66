//! Runtime adapters for Mend (configuration, persisted tool cache).

pub mod cache;
pub mod config;
