//! Domain types for barsync

pub mod bar;
pub mod instrument;

pub use bar::{date_to_utc, Bar, Granularity};
pub use instrument::{normalize_symbol, ExclusionRule, Instrument, DEFAULT_EXCLUSION_PATTERN};
