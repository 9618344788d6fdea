//! Chunked parallel execution
//!
//! Workers pull chunks from a shared queue, sizing each chunk from the
//! adaptive controller at the moment it is taken, and report every chunk's
//! duration back to the controller. Lifecycle is `close` then `join`
//! (finish queued work) or `terminate` then `join` (abandon it).

use super::controller::AdaptiveChunkController;
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<(u64, T)>,
    next_seq: u64,
    closed: bool,
    terminated: bool,
}

struct Shared<T, R> {
    queue: Mutex<QueueState<T>>,
    /// Completed results tagged with their submission sequence
    results: Mutex<Vec<(u64, R)>>,
    notify: Notify,
}

impl<T, R> Shared<T, R> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self, completed: Vec<(u64, R)>) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(completed);
    }

    fn take_results(&self) -> Vec<(u64, R)> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Outcome of a finished run
#[derive(Debug)]
pub struct RunSummary<R> {
    /// Results in submission order
    pub results: Vec<R>,
    pub items_submitted: u64,
    pub items_completed: u64,
    pub items_abandoned: u64,
    pub terminated: bool,
    pub final_batch_size: u32,
    pub adaptation_count: u64,
}

/// Runs a function over submitted items on `worker_count` tasks
pub struct ChunkRunner<T, R> {
    shared: Arc<Shared<T, R>>,
    controller: Arc<AdaptiveChunkController>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    aborts: Vec<AbortHandle>,
}

impl<T, R> ChunkRunner<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawn the workers; must be called within a tokio runtime
    pub fn start<F>(worker_count: usize, controller: Arc<AdaptiveChunkController>, work: F) -> Self
    where
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                next_seq: 0,
                closed: false,
                terminated: false,
            }),
            results: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let work = Arc::new(work);

        let worker_count = worker_count.max(1);
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    shared.clone(),
                    controller.clone(),
                    work.clone(),
                ))
            })
            .collect();
        let aborts = handles.iter().map(|h| h.abort_handle()).collect();

        info!(
            workers = worker_count,
            batch_size = controller.batch_size(),
            adaptive = controller.is_adaptive(),
            "Chunk runner started"
        );

        Self {
            shared,
            controller,
            workers: Mutex::new(Some(handles)),
            aborts,
        }
    }

    pub fn controller(&self) -> &Arc<AdaptiveChunkController> {
        &self.controller
    }

    /// Queue items for processing; fails once the runner is closed
    pub fn submit(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        let count = {
            let mut queue = self.shared.lock();
            if queue.closed || queue.terminated {
                bail!("Chunk runner is closed");
            }
            let before = queue.items.len();
            for item in items {
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.items.push_back((seq, item));
            }
            queue.items.len() - before
        };
        self.shared.notify.notify_waiters();
        Ok(count)
    }

    /// Stop accepting items; queued items still run
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Stop accepting items and abandon queued and in-flight work
    ///
    /// Results of chunks that already finished are kept.
    pub fn terminate(&self) {
        let abandoned = {
            let mut queue = self.shared.lock();
            if queue.terminated {
                return;
            }
            queue.closed = true;
            queue.terminated = true;
            let abandoned = queue.items.len();
            queue.items.clear();
            abandoned
        };
        for abort in &self.aborts {
            abort.abort();
        }
        self.shared.notify.notify_waiters();
        warn!(abandoned = abandoned, "Chunk runner terminated");
    }

    /// Wait for the workers and collect results, closing the runner if still open
    ///
    /// Only the first call returns results; later calls return an empty summary.
    pub async fn join(&self) -> RunSummary<R> {
        self.close();
        let handles = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();

        for handle in handles {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "Chunk worker failed"),
            }
        }
        let mut tagged = self.shared.take_results();
        tagged.sort_by_key(|(seq, _)| *seq);

        let (submitted, terminated) = {
            let queue = self.shared.lock();
            (queue.next_seq, queue.terminated)
        };
        let stats = self.controller.stats();
        let completed = tagged.len() as u64;
        let summary = RunSummary {
            results: tagged.into_iter().map(|(_, r)| r).collect(),
            items_submitted: submitted,
            items_completed: completed,
            items_abandoned: submitted.saturating_sub(completed),
            terminated,
            final_batch_size: stats.current_batch_size,
            adaptation_count: stats.adaptation_count,
        };
        debug!(
            completed = summary.items_completed,
            abandoned = summary.items_abandoned,
            batch_size = summary.final_batch_size,
            "Chunk runner joined"
        );
        summary
    }
}

async fn worker_loop<T, R, F>(
    id: usize,
    shared: Arc<Shared<T, R>>,
    controller: Arc<AdaptiveChunkController>,
    work: Arc<F>,
) where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    loop {
        // Register before inspecting the queue so a wake-up in between is not lost
        let notified = shared.notify.notified();
        let chunk = {
            let mut queue = shared.lock();
            if queue.terminated {
                break;
            }
            if queue.items.is_empty() {
                if queue.closed {
                    break;
                }
                None
            } else {
                let size = (controller.batch_size().max(1) as usize).min(queue.items.len());
                Some(queue.items.drain(..size).collect::<Vec<_>>())
            }
        };

        let Some(chunk) = chunk else {
            notified.await;
            continue;
        };

        let items = chunk.len();
        let work = work.clone();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            chunk
                .into_iter()
                .map(|(seq, item)| (seq, work(item)))
                .collect::<Vec<_>>()
        })
        .await;

        match result {
            Ok(results) => {
                controller.record_batch(items, started.elapsed());
                shared.store(results);
            }
            Err(e) => warn!(worker = id, items = items, error = %e, "Chunk failed"),
        }
    }
}
