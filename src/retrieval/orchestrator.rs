// src/retrieval/orchestrator.rs
use crate::cmf::models::FilingJob;
use crate::retrieval::events::{JobState, RunState};
use crate::retrieval::job::{cancelled, JobResult, RetrievalJob};
use crate::retrieval::stats::RunStatistics;
use crate::utils::error::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

/// Receives every result that carries data, one at a time, as the run progresses.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, result: &JobResult) -> Result<(), StorageError>;
}

/// Sink that keeps nothing. For probes and dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ResultSink for DiscardSink {
    async fn persist(&self, _result: &JobResult) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Runs a work list with at most `max_concurrency` jobs (and so sessions) active.
/// Jobs start in submission order; results are folded by a single aggregator.
pub struct BulkOrchestrator {
    runner: Arc<RetrievalJob>,
}

impl BulkOrchestrator {
    pub fn new(runner: RetrievalJob) -> Self {
        Self { runner: Arc::new(runner) }
    }

    pub async fn run_all(
        &self,
        jobs: Vec<FilingJob>,
        max_concurrency: usize,
        sink: &dyn ResultSink,
        cancel: watch::Receiver<bool>,
    ) -> RunStatistics {
        let started = Instant::now();
        let total = jobs.len();
        let events = self.runner.events();
        let slots = max_concurrency.max(1);

        events.run(RunState::Running, total);
        for job in &jobs {
            events.job(job, JobState::Queued, 0, None);
        }

        let semaphore = Arc::new(Semaphore::new(slots));
        let (result_tx, mut result_rx) = mpsc::channel::<JobResult>(slots * 2);

        // --- Dispatcher: FIFO, one permit per job, stops on cancellation ---
        let dispatcher = {
            let mut cancel = cancel.clone();
            let runner = Arc::clone(&self.runner);
            async move {
                let mut tasks = JoinSet::new();
                let mut queue = jobs.into_iter();
                let mut not_dispatched = 0usize;

                while let Some(job) = queue.next() {
                    let permit = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => None,
                        permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else {
                        not_dispatched = 1 + queue.len();
                        tracing::warn!("Dispatch stopped; {} job(s) left undispatched", not_dispatched);
                        break;
                    };

                    let runner = Arc::clone(&runner);
                    let tx = result_tx.clone();
                    let job_cancel = cancel.clone();
                    tasks.spawn(async move {
                        let result = runner.run_until(job, Some(job_cancel)).await;
                        drop(permit);
                        if tx.send(result).await.is_err() {
                            tracing::error!("Aggregator gone; dropping a job result");
                        }
                    });
                }
                drop(result_tx);

                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        tracing::error!("Job task ended abnormally: {}", e);
                    }
                }
                not_dispatched
            }
        };

        // --- Aggregator: single writer of the statistics ---
        let aggregator = async {
            let mut stats = RunStatistics::default();
            stats.state = RunState::Running;
            while let Some(result) = result_rx.recv().await {
                let persistence_error = if result.outcome.has_data() {
                    match sink.persist(&result).await {
                        Ok(()) => None,
                        Err(e) => {
                            tracing::error!("[{}] Could not persist result: {}", result.job.label(), e);
                            Some(e.to_string())
                        }
                    }
                } else {
                    None
                };
                stats.record(&result, persistence_error);
            }
            stats
        };

        let (not_dispatched, mut stats) = tokio::join!(dispatcher, aggregator);

        stats.not_dispatched = not_dispatched;
        stats.state = if *cancel.borrow() { RunState::Cancelled } else { RunState::Completed };
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        events.run(stats.state, total);
        tracing::info!(
            "Run finished: {} attempted, {} succeeded, {} partial, {} failed, {} not dispatched",
            stats.attempted,
            stats.succeeded,
            stats.partial,
            stats.failed(),
            stats.not_dispatched
        );
        stats
    }
}
