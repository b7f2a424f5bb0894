//! Data layer: listing snapshots, provider access, and the persisted stores.

pub mod atomic;
pub mod provider;
pub mod scripted;
pub mod staleness;
pub mod store;
pub mod universe;
pub mod yahoo;

pub use provider::{BarProvider, FailureClass, ProviderError};
pub use scripted::{ProviderCall, ScriptedProvider};
pub use staleness::StalenessTracker;
pub use store::{BarStore, MergeDelta, RemoveDelta, StoreError, WriteMode};
pub use universe::{resolve_universe, ListingSnapshot, UniverseError, UniverseResolution};
pub use yahoo::YahooProvider;
