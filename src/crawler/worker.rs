//! Bounded-concurrency worker pool
//!
//! Executes one handler per work item with at most N in flight. Two backends
//! satisfy the same contract: `spawned` dispatches each item as its own task
//! gated by a semaphore, `inline` drives everything from a single cooperative
//! task. Outcomes complete in any order, one item's failure never aborts the
//! rest, and a shared shutdown flag stops admission of new items while
//! letting in-flight ones finish.

use crate::config::WorkerBackend;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Per-item result collected by the pool
#[derive(Debug)]
pub enum Outcome<T> {
    /// The item was processed; carries its result
    Done(T),
    /// The item was deliberately not processed (dedup, shutdown)
    Skipped(String),
    /// The item failed after its own retries were exhausted
    Failed(String),
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }
}

/// Dispatches work items with a fixed concurrency bound
pub struct WorkerPool {
    concurrency: usize,
    backend: WorkerBackend,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, backend: WorkerBackend, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            concurrency: concurrency.max(1),
            backend,
            shutdown,
        }
    }

    /// Runs the handler over every item, at most `concurrency` in flight
    ///
    /// Returns one outcome per input item. Ordering of the returned vector
    /// follows completion, not input; callers aggregate by summing, never by
    /// position.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, handler: F) -> Vec<Outcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        match self.backend {
            WorkerBackend::Spawned => self.run_spawned(items, handler).await,
            WorkerBackend::Inline => self.run_inline(items, handler).await,
        }
    }

    async fn run_spawned<I, T, F, Fut>(&self, items: Vec<I>, handler: F) -> Vec<Outcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            if self.shutdown.load(Ordering::SeqCst) {
                outcomes.push(Outcome::Skipped("interrupted".to_string()));
                continue;
            }

            // Admission waits for a permit, so at most `concurrency` tasks
            // are ever in flight.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let handler = handler.clone();
            set.spawn(async move {
                let _permit = permit;
                handler(item).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(Outcome::Failed(format!("worker task panicked: {}", e))),
            }
        }

        outcomes
    }

    async fn run_inline<I, T, F, Fut>(&self, items: Vec<I>, handler: F) -> Vec<Outcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();

        stream::iter(items)
            .map(move |item| {
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.load(Ordering::SeqCst) {
                        return Outcome::Skipped("interrupted".to_string());
                    }
                    handler(item).await
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pool(concurrency: usize, backend: WorkerBackend) -> WorkerPool {
        WorkerPool::new(concurrency, backend, Arc::new(AtomicBool::new(false)))
    }

    async fn peak_concurrency(backend: WorkerBackend, limit: usize, items: usize) -> usize {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler = {
            let active = active.clone();
            let peak = peak.clone();
            move |_item: usize| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Outcome::Done(())
                }
            }
        };

        let outcomes = pool(limit, backend).run((0..items).collect(), handler).await;
        assert_eq!(outcomes.len(), items);
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_spawned_backend_respects_concurrency_bound() {
        let peak = peak_concurrency(WorkerBackend::Spawned, 4, 32).await;
        assert!(peak <= 4, "peak concurrency {} exceeded limit 4", peak);
        assert!(peak >= 2, "pool never ran items concurrently");
    }

    #[tokio::test]
    async fn test_inline_backend_respects_concurrency_bound() {
        let peak = peak_concurrency(WorkerBackend::Inline, 4, 32).await;
        assert!(peak <= 4, "peak concurrency {} exceeded limit 4", peak);
        assert!(peak >= 2, "pool never ran items concurrently");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let handler = |item: usize| async move {
            if item == 3 {
                Outcome::Failed("boom".to_string())
            } else {
                Outcome::Done(item)
            }
        };

        let outcomes = pool(2, WorkerBackend::Spawned)
            .run((0..10).collect(), handler)
            .await;

        assert_eq!(outcomes.len(), 10);
        assert_eq!(outcomes.iter().filter(|o| o.is_done()).count(), 9);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Failed(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_outcomes_complete_out_of_order() {
        // Slow first item; later items must not wait for it
        let handler = |item: u64| async move {
            if item == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Outcome::Done(item)
        };

        let outcomes = pool(4, WorkerBackend::Spawned)
            .run(vec![0u64, 1, 2, 3], handler)
            .await;

        let values: Vec<u64> = outcomes
            .into_iter()
            .filter_map(|o| match o {
                Outcome::Done(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 4);
        // Aggregate equality regardless of order
        assert_eq!(values.iter().sum::<u64>(), 6);
    }

    #[tokio::test]
    async fn test_shutdown_skips_unadmitted_items() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let pool = WorkerPool::new(2, WorkerBackend::Spawned, shutdown);

        let outcomes = pool
            .run((0..5).collect::<Vec<usize>>(), |_| async {
                Outcome::Done(())
            })
            .await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Outcome::Skipped(reason) if reason == "interrupted")));
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_outcomes() {
        let outcomes = pool(2, WorkerBackend::Inline)
            .run(Vec::<usize>::new(), |_| async { Outcome::Done(()) })
            .await;
        assert!(outcomes.is_empty());
    }
}
