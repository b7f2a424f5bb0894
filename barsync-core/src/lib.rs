//! Barsync Core — domain types, configuration, and the data layer.
//!
//! This crate holds everything that touches persisted or remote state:
//! - Domain types (bars, granularities, listing instruments)
//! - The immutable run configuration and its validation
//! - Listing snapshot parsing and universe resolution
//! - The per-granularity bar stores with atomic whole-file replacement
//! - The staleness tracker
//! - The provider abstraction, a Yahoo Finance client, and a scripted provider

pub mod config;
pub mod data;
pub mod domain;

pub use config::{ConfigError, SyncConfig};
