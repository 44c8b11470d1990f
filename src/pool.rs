//! Fixed-size worker pool (spec.md §4.C), grounded on
//! `original_source/internal/accrual/workerspool/workerspool.go`: an
//! inbound job channel, an outbound result channel, `N` workers each
//! looping on the job channel until it is closed.
//!
//! The Go version's job closure returns `(*data.Order, error)`; once
//! errors are logged inside the closure itself (matching "logged, no
//! result emitted" in the spec), that three-way outcome collapses into
//! `Option<Order>` the Rust way.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::info;

use crate::domain::Order;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type Job = Box<dyn FnOnce() -> BoxFuture<Option<Order>> + Send>;

/// The submitter half: a cheaply-cloneable handle onto the jobs channel.
/// Deliberately holds no reference to the results channel, so a task that
/// only submits jobs (the poller) never contends with the task draining
/// results (the updater) for a shared lock.
#[derive(Clone)]
pub struct Pool {
    jobs_tx: mpsc::Sender<Job>,
}

/// The results half: owned outright by whichever task drains it. Not
/// `Clone` — only one consumer is ever meant to hold it.
pub struct Results {
    results_rx: mpsc::Receiver<Order>,
}

impl Pool {
    /// Spawns `count` workers sharing one bounded job channel (capacity =
    /// `count`, matching the teacher's buffered Go channel of the same size)
    /// and one result channel, returning independent submit/drain handles —
    /// the Rust equivalent of the Go `workerspool.go`'s separate jobs and
    /// results channels.
    pub fn create(count: usize) -> (Pool, Results) {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(count.max(1));
        let (results_tx, results_rx) = mpsc::channel::<Order>(count.max(1));
        let jobs_rx = std::sync::Arc::new(tokio::sync::Mutex::new(jobs_rx));

        for worker_id in 0..count {
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move { Self::worker(worker_id, jobs_rx, results_tx).await });
        }

        (Pool { jobs_tx }, Results { results_rx })
    }

    async fn worker(
        worker_id: usize,
        jobs_rx: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        results_tx: mpsc::Sender<Order>,
    ) {
        loop {
            let job = {
                let mut rx = jobs_rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                info!(worker_id, "worker stopping, jobs channel closed");
                return;
            };

            match job().await {
                Some(order) => {
                    if results_tx.send(order).await.is_err() {
                        info!(worker_id, "results channel closed, dropping job result");
                    }
                }
                None => {
                    info!(worker_id, "job produced no result");
                }
            }
        }
    }

    pub async fn submit(&self, job: Job) {
        if self.jobs_tx.send(job).await.is_err() {
            tracing::warn!("submitted job after the pool's jobs channel was closed");
        }
    }

    /// Closing the sender drains the workers (each finishes its current job
    /// then exits once the channel is empty and closed), matching "closing
    /// jobs drains workers" in spec.md §4.C.
    pub fn close_jobs(self) {
        drop(self.jobs_tx);
    }
}

impl Results {
    pub async fn next_result(&mut self) -> Option<Order> {
        self.results_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_order(id: i64) -> Order {
        Order {
            id,
            number: format!("{id}"),
            user_id: 1,
            status: crate::domain::OrderStatus::Processed,
            bonus_entry_id: id,
            accrual: Some(Decimal::new(100, 2)),
            uploaded_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn a_successful_job_is_delivered_on_the_result_channel() {
        let (pool, mut results) = Pool::create(2);
        pool.submit(Box::new(|| Box::pin(async { Some(sample_order(1)) }))).await;

        let result = results.next_result().await.unwrap();
        assert_eq!(result.id, 1);
    }

    #[tokio::test]
    async fn a_job_returning_none_emits_no_result() {
        let (pool, mut results) = Pool::create(1);
        pool.submit(Box::new(|| Box::pin(async { None }))).await;
        pool.submit(Box::new(|| Box::pin(async { Some(sample_order(2)) }))).await;

        let result = results.next_result().await.unwrap();
        assert_eq!(result.id, 2);
    }

    #[tokio::test]
    async fn closing_jobs_eventually_ends_the_result_stream() {
        let (pool, mut results) = Pool::create(2);
        pool.close_jobs();
        assert!(results.next_result().await.is_none());
    }
}
