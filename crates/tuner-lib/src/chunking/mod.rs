//! Runtime batch-size adaptation
//!
//! This module provides:
//! - The adaptive chunk controller that retunes batch size from observed durations
//! - A tokio chunk runner with graceful and forced shutdown

mod controller;
mod runner;

pub use controller::{AdaptiveChunkController, BatchResize, ChunkStats};
pub use runner::{ChunkRunner, RunSummary};
