//! Batched, bounded-concurrency execution of per-item work.
//!
//! Items are cut into batches. Up to `max_concurrency` batches form a group
//! and run as separate tasks; items inside a batch run one after another in
//! input order. Each item gets its own task so a panic is confined to it. Groups are separated by a delay that grows with the number of
//! batch workers still busy in this processor, which includes other jobs.

use crate::metrics_defs::ACTIVE_WORKERS;
use shared::gauge;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessingPlan {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub group_delay: Duration,
    pub adaptive_delay: bool,
}

impl ProcessingPlan {
    pub fn for_items(total: usize) -> Self {
        let (batch_size, max_concurrency, delay_ms) = match total {
            0..=10 => (2, 2, 500),
            11..=50 => (5, 3, 1_000),
            51..=200 => (10, 4, 2_000),
            _ => (20, 5, 3_000),
        };
        ProcessingPlan {
            batch_size,
            max_concurrency,
            group_delay: Duration::from_millis(delay_ms),
            adaptive_delay: true,
        }
    }

    /// Delay before the next group given the number of busy workers.
    pub fn delay_for(&self, active_workers: usize) -> Duration {
        if self.adaptive_delay {
            self.group_delay
                .mul_f64(1.0 + 0.5 * active_workers as f64)
        } else {
            self.group_delay
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub processed_items: usize,
}

#[derive(Debug, PartialEq)]
pub enum ItemError<E> {
    Failed(E),
    /// The task running this item panicked.
    Panicked,
    /// Skipped because the run was cancelled.
    Cancelled,
}

type Batch<T> = Vec<(usize, T)>;
type BatchResults<R, E> = Vec<(usize, Result<R, ItemError<E>>)>;

/// Keeps the shared worker count accurate even if a batch panics.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(ACTIVE_WORKERS).set(active as f64);
        WorkerGuard(counter)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let active = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!(ACTIVE_WORKERS).set(active as f64);
    }
}

#[derive(Clone, Default)]
pub struct ParallelProcessor {
    active_workers: Arc<AtomicUsize>,
}

impl ParallelProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Runs `f` over every item and returns one result per item, in input order.
    pub async fn process<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        plan: &ProcessingPlan,
        f: F,
        progress: Option<mpsc::Sender<BatchProgress>>,
        cancel: &CancellationToken,
    ) -> Vec<Result<R, ItemError<E>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let total_items = items.len();
        let batch_size = plan.batch_size.max(1);
        let max_concurrency = plan.max_concurrency.max(1);

        let mut batches: Vec<Batch<T>> = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match batches.last_mut() {
                Some(batch) if batch.len() < batch_size => batch.push((index, item)),
                _ => batches.push(vec![(index, item)]),
            }
        }
        let total_batches = batches.len();

        tracing::debug!(
            total_items,
            total_batches,
            batch_size,
            max_concurrency,
            "starting parallel processing"
        );

        let f = Arc::new(f);
        let mut results: Vec<Option<Result<R, ItemError<E>>>> =
            (0..total_items).map(|_| None).collect();
        let mut completed_batches = 0;
        let mut processed_items = 0;

        let mut remaining = batches.into_iter().peekable();
        while remaining.peek().is_some() {
            let group: Vec<Batch<T>> = remaining.by_ref().take(max_concurrency).collect();

            let mut join_set = JoinSet::new();
            let mut task_items: HashMap<tokio::task::Id, Vec<usize>> = HashMap::new();

            for batch in group {
                let indices = batch.iter().map(|(index, _)| *index).collect();
                let guard = WorkerGuard::new(self.active_workers.clone());
                let f = f.clone();
                let cancel = cancel.clone();

                let handle = join_set.spawn(async move {
                    let _guard = guard;
                    let mut out: BatchResults<R, E> = Vec::with_capacity(batch.len());
                    for (index, item) in batch {
                        if cancel.is_cancelled() {
                            out.push((index, Err(ItemError::Cancelled)));
                            continue;
                        }
                        let result = match tokio::spawn(f(item)).await {
                            Ok(result) => result.map_err(ItemError::Failed),
                            Err(e) => {
                                tracing::error!(error = %e, index, "item worker failed");
                                Err(ItemError::Panicked)
                            }
                        };
                        out.push((index, result));
                    }
                    out
                });
                task_items.insert(handle.id(), indices);
            }

            while let Some(joined) = join_set.join_next_with_id().await {
                let finished = match joined {
                    Ok((id, batch_results)) => {
                        task_items.remove(&id);
                        batch_results
                    }
                    Err(e) => {
                        let indices = task_items.remove(&e.id()).unwrap_or_default();
                        tracing::error!(error = %e, items = indices.len(), "batch worker failed");
                        indices
                            .into_iter()
                            .map(|index| (index, Err(ItemError::Panicked)))
                            .collect()
                    }
                };

                processed_items += finished.len();
                for (index, result) in finished {
                    results[index] = Some(result);
                }
                completed_batches += 1;

                if let Some(progress) = &progress {
                    let update = BatchProgress {
                        completed_batches,
                        total_batches,
                        processed_items,
                    };
                    if progress.send(update).await.is_err() {
                        tracing::debug!("progress receiver dropped");
                    }
                }
            }

            if remaining.peek().is_none() || cancel.is_cancelled() {
                continue;
            }

            let delay = plan.delay_for(self.active_workers());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("processing cancelled during group delay");
                }
            }
        }

        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(ItemError::Cancelled)))
            .collect()
    }
}
