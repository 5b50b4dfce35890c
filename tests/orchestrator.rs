// tests/orchestrator.rs
mod common;

use async_trait::async_trait;
use cmf_extractor::cmf::{AccountingStandard, Consolidation, FilingJob, PolitenessGate, SessionFactory};
use cmf_extractor::config::{PolitenessConfig, RetryPolicy};
use cmf_extractor::retrieval::{
    event_channel, BulkOrchestrator, DiscardSink, EventEmitter, JobOutcome, JobResult, JobState, ResultSink,
    RetrievalJob, RunEvent, RunState,
};
use cmf_extractor::utils::{ErrorKind, StorageError};
use common::{coded_page, company, fast_policy, period, Script, ScriptedFactory};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Keeps every persisted result for inspection.
#[derive(Default)]
struct CollectingSink {
    results: Mutex<Vec<JobResult>>,
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn persist(&self, result: &JobResult) -> Result<(), StorageError> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl ResultSink for FailingSink {
    async fn persist(&self, _result: &JobResult) -> Result<(), StorageError> {
        Err(StorageError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }
}

fn job(rut: u32, key: u32) -> FilingJob {
    FilingJob::new(
        company(rut, "Empresa"),
        period(key),
        Consolidation::Consolidated,
        AccountingStandard::IfrsFull,
    )
}

fn orchestrator(factory: &ScriptedFactory, max_attempts: u32) -> BulkOrchestrator {
    let factory: Arc<dyn SessionFactory> = Arc::new(factory.clone());
    BulkOrchestrator::new(RetrievalJob::new(factory, PolitenessGate::disabled(), fast_policy(max_attempts)))
}

#[tokio::test]
async fn test_two_periods_of_one_company_succeed() {
    let factory = ScriptedFactory::new(
        vec![
            ((96505760, 202412), Script::Page(coded_page(202412))),
            ((96505760, 202409), Script::Page(coded_page(202409))),
        ],
        Duration::ZERO,
    );
    let sink = CollectingSink::default();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let stats = orchestrator(&factory, 3)
        .run_all(vec![job(96505760, 202412), job(96505760, 202409)], 2, &sink, cancel_rx)
        .await;

    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed(), 0);
    assert_eq!(stats.state, RunState::Completed);

    let results = sink.results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for result in results.iter() {
        assert!(matches!(result.outcome, JobOutcome::Success(_)));
        assert_eq!(result.taxonomy, Some("ifrs-coded/v1"));
        for statement in result.outcome.statements() {
            assert_eq!(statement.header_count(), 2);
            assert_eq!(statement.leaf_count(), 5);
            let order: Vec<usize> = statement.items.iter().map(|i| i.order_index).collect();
            assert_eq!(order, (0..7).collect::<Vec<_>>());
        }
    }
}

#[tokio::test]
async fn test_sessions_never_exceed_max_concurrency() {
    let keys = [202112, 202203, 202206, 202209, 202212, 202303, 202306, 202309, 202312, 202403];
    let mut scripts = Vec::new();
    let mut jobs = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let rut = 76000000 + (i as u32 % 4);
        scripts.push(((rut, *key), Script::Page(coded_page(*key))));
        jobs.push(job(rut, *key));
    }
    let factory = ScriptedFactory::new(scripts, Duration::from_millis(15));
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let stats = orchestrator(&factory, 2).run_all(jobs, 3, &DiscardSink, cancel_rx).await;

    assert_eq!(stats.attempted, keys.len());
    assert_eq!(stats.succeeded, keys.len());
    let counters = &factory.counters;
    assert!(counters.max_open.load(Ordering::SeqCst) <= 3);
    assert!(counters.max_open.load(Ordering::SeqCst) >= 1);
    assert_eq!(counters.opened.load(Ordering::SeqCst), counters.closed.load(Ordering::SeqCst));
    assert_eq!(counters.open_now.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transient_failure_exhausts_attempts_without_affecting_siblings() {
    let factory = ScriptedFactory::new(
        vec![
            ((91041000, 202406), Script::Transient),
            ((91041000, 202409), Script::Page(coded_page(202409))),
        ],
        Duration::ZERO,
    );
    let sink = CollectingSink::default();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let stats = orchestrator(&factory, 3)
        .run_all(vec![job(91041000, 202406), job(91041000, 202409)], 2, &sink, cancel_rx)
        .await;

    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.failed_by_kind.get(&ErrorKind::TransientNetworkError), Some(&1));

    let failed = stats.failures().next().unwrap();
    assert_eq!(failed.period, 202406);
    assert_eq!(failed.attempts, 3);
    // 3 attempts for the failing job, 1 for the sibling
    assert_eq!(factory.counters.requests.load(Ordering::SeqCst), 4);
    // Failures are never handed to the sink
    assert_eq!(sink.results.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_non_retryable_failure_is_not_retried() {
    let factory = ScriptedFactory::new(
        vec![
            ((91041000, 202406), Script::Unpublished),
            ((91041000, 202409), Script::Page("<html><body><p>sin estados</p></body></html>".to_string())),
        ],
        Duration::ZERO,
    );
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let stats = orchestrator(&factory, 5)
        .run_all(
            vec![job(91041000, 202406), job(91041000, 202409)],
            1,
            &DiscardSink,
            cancel_rx,
        )
        .await;

    assert_eq!(stats.failed(), 2);
    assert_eq!(stats.failed_by_kind.get(&ErrorKind::ElementNotFound), Some(&1));
    assert_eq!(stats.failed_by_kind.get(&ErrorKind::UnknownTaxonomy), Some(&1));
    assert!(stats.jobs.iter().all(|r| r.attempts == 1));
}

#[tokio::test]
async fn test_cancel_before_dispatch_leaves_jobs_undispatched() {
    let factory = ScriptedFactory::new(vec![((96505760, 202412), Script::Page(coded_page(202412)))], Duration::ZERO);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true).unwrap();

    let stats = orchestrator(&factory, 3)
        .run_all(
            vec![job(96505760, 202412), job(96505760, 202409), job(96505760, 202406)],
            2,
            &DiscardSink,
            cancel_rx,
        )
        .await;

    assert_eq!(stats.state, RunState::Cancelled);
    assert_eq!(stats.not_dispatched, 3);
    assert_eq!(stats.attempted, 0);
    assert_eq!(factory.counters.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_persistence_failure_is_counted_separately() {
    let factory = ScriptedFactory::new(vec![((96505760, 202412), Script::Page(coded_page(202412)))], Duration::ZERO);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let stats = orchestrator(&factory, 1)
        .run_all(vec![job(96505760, 202412)], 1, &FailingSink, cancel_rx)
        .await;

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.persistence_failures, 1);
    assert!(stats.has_failures());
    assert_eq!(stats.jobs[0].error_kind, Some(ErrorKind::PersistenceError));
}

#[tokio::test]
async fn test_progress_events_follow_job_lifecycle() {
    let factory = ScriptedFactory::new(vec![((91041000, 202406), Script::Transient)], Duration::ZERO);
    let (events_tx, mut events_rx) = event_channel(64);
    let runner = RetrievalJob::new(Arc::new(factory), PolitenessGate::disabled(), fast_policy(2))
        .with_events(EventEmitter::new(events_tx));
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    BulkOrchestrator::new(runner)
        .run_all(vec![job(91041000, 202406)], 1, &DiscardSink, cancel_rx)
        .await;

    let mut job_states = Vec::new();
    let mut run_states = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        match event {
            RunEvent::Job { state, .. } => job_states.push(state),
            RunEvent::Run { state, .. } => run_states.push(state),
        }
    }
    assert_eq!(
        job_states,
        vec![JobState::Queued, JobState::Running, JobState::Retrying, JobState::Running, JobState::Failed]
    );
    assert_eq!(run_states, vec![RunState::Running, RunState::Completed]);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_finished_work() {
    let factory = ScriptedFactory::new(
        vec![
            ((96505760, 202412), Script::Page(coded_page(202412))),
            ((96505760, 202409), Script::Transient),
            ((96505760, 202406), Script::Page(coded_page(202406))),
        ],
        Duration::from_millis(100),
    );
    let sink = CollectingSink::default();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();
    });

    let stats = orchestrator(&factory, 3)
        .run_all(
            vec![job(96505760, 202412), job(96505760, 202409), job(96505760, 202406)],
            2,
            &sink,
            cancel_rx,
        )
        .await;

    assert_eq!(stats.state, RunState::Cancelled);
    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.not_dispatched, 1);

    // The in-flight attempt ran to completion but was not retried
    let failed = stats.failures().next().unwrap();
    assert_eq!(failed.period, 202409);
    assert_eq!(failed.error_kind, Some(ErrorKind::TransientNetworkError));
    assert_eq!(failed.attempts, 1);
    assert_eq!(factory.counters.requests.load(Ordering::SeqCst), 2);
    assert_eq!(factory.counters.open_now.load(Ordering::SeqCst), 0);

    let results = sink.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job.period, period(202412));
}

#[tokio::test]
async fn test_cancel_during_backoff_reports_last_failure() {
    let factory = ScriptedFactory::new(vec![((91041000, 202406), Script::Transient)], Duration::ZERO);
    let slow_retry = RetryPolicy {
        max_attempts: 5,
        backoff_base: Duration::from_secs(10),
        backoff_max: Duration::from_secs(10),
    };
    let runner = RetrievalJob::new(Arc::new(factory.clone()), PolitenessGate::disabled(), slow_retry);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();
    });

    let started = Instant::now();
    let result = runner.run_until(job(91041000, 202406), Some(cancel_rx)).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.attempts, 1);
    assert_eq!(result.outcome.error_kind(), Some(ErrorKind::TransientNetworkError));
    match &result.outcome {
        JobOutcome::Failure { message, .. } => assert!(message.starts_with("cancelled before retry")),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(factory.counters.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_jobs_of_one_company_are_spaced_by_the_gate() {
    let spacing = Duration::from_millis(60);
    let scripts = vec![
        ((96505760, 202412), Script::Page(coded_page(202412))),
        ((96505760, 202409), Script::Page(coded_page(202409))),
        ((91041000, 202412), Script::Page(coded_page(202412))),
        ((91041000, 202409), Script::Page(coded_page(202409))),
    ];
    let spaced = |factory: &ScriptedFactory| {
        let gate = PolitenessGate::new(PolitenessConfig { per_company: spacing, per_slot: None });
        BulkOrchestrator::new(RetrievalJob::new(Arc::new(factory.clone()), gate, fast_policy(1)))
    };

    // Two filings of one company: four gated requests, each one spacing apart
    let factory = ScriptedFactory::new(scripts.clone(), Duration::ZERO);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let started = Instant::now();
    let stats = spaced(&factory)
        .run_all(vec![job(96505760, 202412), job(96505760, 202409)], 2, &DiscardSink, cancel_rx)
        .await;
    assert_eq!(stats.succeeded, 2);
    assert!(started.elapsed() >= spacing * 5 / 2);

    // Interleaved companies: each keeps its own spacing, dispatch stays in list order
    let a = company(96505760, "EMPRESA A");
    let b = company(91041000, "EMPRESA B");
    let jobs = FilingJob::enumerate(&[a, b], 2024, 2024, &[9, 12], Consolidation::Consolidated, AccountingStandard::IfrsFull);
    let expected: Vec<(String, u32)> = jobs.iter().map(|j| (j.company.tax_id.to_string(), j.period.key())).collect();
    assert_eq!(expected.iter().map(|(_, k)| *k).collect::<Vec<_>>(), vec![202412, 202412, 202409, 202409]);

    let factory = ScriptedFactory::new(scripts, Duration::ZERO);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let stats = spaced(&factory).run_all(jobs, 1, &DiscardSink, cancel_rx).await;
    assert_eq!(stats.succeeded, 4);
    let seen: Vec<(String, u32)> = stats.jobs.iter().map(|r| (r.rut.clone(), r.period)).collect();
    assert_eq!(seen, expected);
}
