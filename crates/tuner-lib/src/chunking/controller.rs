//! Adaptive batch sizing
//!
//! Tracks the durations of recently completed batches in a small sliding
//! window and rescales the batch size when their moving average leaves the
//! tolerance band around the target duration. A resize clears the window,
//! since the old durations describe a different regime.

use crate::config::ChunkingConfig;
use crate::models::AdaptiveChunkingParams;
use crate::observability::{StructuredLogger, TunerMetrics};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A batch size change decided by the controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchResize {
    pub old_size: u32,
    pub new_size: u32,
    pub average_secs: f64,
    /// Observed average over target duration
    pub ratio: f64,
}

/// Live controller statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkStats {
    pub current_batch_size: u32,
    pub items_processed: u64,
    pub batches_completed: u64,
    pub adaptation_count: u64,
    /// Moving average of the current window, if it holds any samples
    pub average_duration_secs: Option<f64>,
    pub adaptive: bool,
}

#[derive(Debug)]
struct WindowState {
    batch_size: u32,
    durations: VecDeque<f64>,
    items_processed: u64,
    batches_completed: u64,
    adaptation_count: u64,
}

/// Retunes batch size from observed per-batch durations
#[derive(Debug)]
pub struct AdaptiveChunkController {
    config: ChunkingConfig,
    adaptive: bool,
    state: Mutex<WindowState>,
    metrics: TunerMetrics,
    logger: StructuredLogger,
}

impl AdaptiveChunkController {
    /// Adaptive controller starting at `initial_batch_size`
    pub fn new(initial_batch_size: u32, config: ChunkingConfig) -> Self {
        Self::build(initial_batch_size, config, true)
    }

    /// Controller following predicted adaptation parameters
    pub fn from_params(
        initial_batch_size: u32,
        params: &AdaptiveChunkingParams,
        base: ChunkingConfig,
    ) -> Self {
        let min_batch_size = params.min_batch_size.max(1);
        let config = ChunkingConfig {
            adaptation_rate: params.adaptation_rate,
            min_batch_size,
            max_batch_size: params.max_batch_size.max(min_batch_size),
            ..base
        };
        Self::build(initial_batch_size, config, params.enabled)
    }

    /// Caller-chosen batch size; never adapts
    pub fn fixed(batch_size: u32) -> Self {
        let batch_size = batch_size.max(1);
        let config = ChunkingConfig {
            min_batch_size: batch_size,
            max_batch_size: batch_size,
            ..ChunkingConfig::default()
        };
        Self::build(batch_size, config, false)
    }

    fn build(initial_batch_size: u32, mut config: ChunkingConfig, adaptive: bool) -> Self {
        config.min_batch_size = config.min_batch_size.max(1);
        config.max_batch_size = config.max_batch_size.max(config.min_batch_size);
        config.window_size = config.window_size.max(1);
        let batch_size = initial_batch_size.clamp(config.min_batch_size, config.max_batch_size);

        Self {
            state: Mutex::new(WindowState {
                batch_size,
                durations: VecDeque::with_capacity(config.window_size),
                items_processed: 0,
                batches_completed: 0,
                adaptation_count: 0,
            }),
            config,
            adaptive,
            metrics: TunerMetrics::new(),
            logger: StructuredLogger::new("local"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // The window is always left consistent, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Batch size for the next dispatch
    pub fn batch_size(&self) -> u32 {
        self.lock().batch_size
    }

    /// Record one completed batch; returns the resize it triggered, if any
    pub fn record_batch(&self, items: usize, duration: Duration) -> Option<BatchResize> {
        let resize = {
            let mut state = self.lock();
            state.items_processed += items as u64;
            state.batches_completed += 1;
            if !self.adaptive {
                return None;
            }

            state.durations.push_back(duration.as_secs_f64());
            while state.durations.len() > self.config.window_size {
                state.durations.pop_front();
            }
            let resize = self.evaluate(&state)?;
            state.batch_size = resize.new_size;
            state.durations.clear();
            state.adaptation_count += 1;
            resize
        };

        self.metrics.inc_batch_resizes();
        self.logger.log_resize(
            resize.old_size,
            resize.new_size,
            resize.average_secs,
            self.config.target_batch_secs,
        );
        Some(resize)
    }

    /// Decide whether the current window calls for a new batch size
    fn evaluate(&self, state: &WindowState) -> Option<BatchResize> {
        if state.durations.len() < self.config.min_samples.max(1) {
            return None;
        }
        let target = self.config.target_batch_secs;
        if target <= 0.0 {
            return None;
        }
        let average = state.durations.iter().sum::<f64>() / state.durations.len() as f64;
        let ratio = average / target;
        if ratio <= 0.0 || !ratio.is_finite() {
            return None;
        }
        let tolerance = self.config.tolerance.abs();
        if ratio >= 1.0 - tolerance && ratio <= 1.0 + tolerance {
            return None;
        }

        let current = state.batch_size as f64;
        let proposed = current * (1.0 + (1.0 / ratio - 1.0) * self.config.adaptation_rate);
        let new_size = proposed
            .round()
            .clamp(self.config.min_batch_size as f64, self.config.max_batch_size as f64)
            as u32;

        let change = (new_size as f64 - current).abs() / current;
        if change <= self.config.min_change {
            return None;
        }
        Some(BatchResize {
            old_size: state.batch_size,
            new_size,
            average_secs: average,
            ratio,
        })
    }

    pub fn stats(&self) -> ChunkStats {
        let state = self.lock();
        let average_duration_secs = if state.durations.is_empty() {
            None
        } else {
            Some(state.durations.iter().sum::<f64>() / state.durations.len() as f64)
        };
        ChunkStats {
            current_batch_size: state.batch_size,
            items_processed: state.items_processed,
            batches_completed: state.batches_completed,
            adaptation_count: state.adaptation_count,
            average_duration_secs,
            adaptive: self.adaptive,
        }
    }
}
