//! Persisted tuner state
//!
//! This module provides:
//! - The key-value repository contract with file and in-memory implementations
//! - Format-versioned record envelopes with forward-only migration

mod repository;
mod versioning;

pub use repository::{keys, FileRepository, MemoryRepository, RepositoryError, StateRepository};
pub use versioning::{decode, encode, migrate, RecordKind, CURRENT_FORMAT_VERSION};
