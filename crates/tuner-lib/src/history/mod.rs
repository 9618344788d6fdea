//! Execution history
//!
//! This module provides:
//! - The append-only history store with repository persistence
//! - Machine fingerprints and cross-machine similarity weighting
//! - Importance-weighted pruning that bounds the store size

mod fingerprint;
mod pruning;
mod store;

pub use pruning::{HistoryPruner, PruneOutcome, PruneReport};
pub use store::{record_key, HistoryStore};
