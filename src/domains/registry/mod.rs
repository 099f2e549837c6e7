//! Aggregated registry.
//!
//! - `aggregate.rs` - [`AggregatedRegistry`], one immutable generation
//! - `reloader.rs` - [`Aggregator`], the poll loop and hot-reload state machine

mod aggregate;
mod reloader;

pub use aggregate::AggregatedRegistry;
pub use reloader::{Aggregator, PollOutcome, RegistryState, RegistryStatus, Topology};
