// src/retrieval/job.rs
// --- Imports ---
use crate::cmf::models::FilingJob;
use crate::cmf::politeness::PolitenessGate;
use crate::cmf::session::{FilingQuery, SessionFactory, SessionGuard};
use crate::config::RetryPolicy;
use crate::extractors::table::{HierarchicalTableExtractor, StatementExtract};
use crate::extractors::taxonomy::{StatementKind, TaxonomyDetector};
use crate::retrieval::events::{EventEmitter, JobState};
use crate::utils::error::{ErrorKind, ExtractError, NavigationError};
use crate::utils::html_debug;
use scraper::Html;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

// --- Data Structures ---

/// Terminal state of one job. Exactly one variant per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobOutcome {
    /// Balance, income and cash flow, in that order, all non-empty.
    Success(Box<[StatementExtract; 3]>),
    /// Some statements were found; `missing` lists the kinds that were not.
    PartialSuccess {
        statements: Vec<StatementExtract>,
        missing: Vec<StatementKind>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl JobOutcome {
    pub fn statements(&self) -> &[StatementExtract] {
        match self {
            JobOutcome::Success(statements) => statements.as_slice(),
            JobOutcome::PartialSuccess { statements, .. } => statements,
            JobOutcome::Failure { .. } => &[],
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Anything worth handing to persistence.
    pub fn has_data(&self) -> bool {
        !matches!(self, JobOutcome::Failure { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success(_) => "success",
            JobOutcome::PartialSuccess { .. } => "partial",
            JobOutcome::Failure { .. } => "failure",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job: FilingJob,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
    pub attempts: u32,
    /// Layout version the filing was read with, when detection got that far.
    pub taxonomy: Option<&'static str>,
}

/// What one attempt produced before outcome classification.
struct Extraction {
    taxonomy: &'static str,
    statements: Vec<StatementExtract>,
}

enum AttemptError {
    Navigation(NavigationError),
    Extract { error: ExtractError, markup: String },
}

impl AttemptError {
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Navigation(e) => e.kind(),
            AttemptError::Extract { error, .. } => error.kind(),
        }
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Navigation(e) => e.to_string(),
            AttemptError::Extract { error, .. } => error.to_string(),
        }
    }
}

impl From<NavigationError> for AttemptError {
    fn from(err: NavigationError) -> Self {
        AttemptError::Navigation(err)
    }
}

/// Resolves once the run is cancelled. Never resolves if the signal's sender
/// goes away without having fired.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => cancelled(rx).await,
        None => std::future::pending::<()>().await,
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

// --- Job Runner ---

/// Session + detector + extractor for one (company, period). Shared by all
/// workers of a run; holds no per-job state.
pub struct RetrievalJob {
    factory: Arc<dyn SessionFactory>,
    gate: PolitenessGate,
    policy: RetryPolicy,
    detector: TaxonomyDetector,
    extractor: HierarchicalTableExtractor,
    events: EventEmitter,
    debug_dir: Option<PathBuf>,
}

impl RetrievalJob {
    pub fn new(factory: Arc<dyn SessionFactory>, gate: PolitenessGate, policy: RetryPolicy) -> Self {
        Self {
            factory,
            gate,
            policy,
            detector: TaxonomyDetector::new(),
            extractor: HierarchicalTableExtractor::new(),
            events: EventEmitter::default(),
            debug_dir: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_extractor(mut self, extractor: HierarchicalTableExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Pages failing detection or extraction are dumped here with fingerprints highlighted.
    pub fn with_debug_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dir = Some(dir.into());
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Runs a job to completion. Every failure ends up in the outcome.
    pub async fn run(&self, job: FilingJob) -> JobResult {
        self.run_until(job, None).await
    }

    /// As `run`, checking `cancel` between attempts. A job cancelled while waiting
    /// to retry ends as a failure carrying the last error kind.
    pub async fn run_until(&self, job: FilingJob, mut cancel: Option<watch::Receiver<bool>>) -> JobResult {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut taxonomy = None;

        let outcome = loop {
            attempt += 1;
            self.events.job(&job, JobState::Running, attempt, None);

            let err = match self.attempt(&job).await {
                Ok(extraction) => {
                    taxonomy = Some(extraction.taxonomy);
                    break classify(extraction.statements);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if !kind.is_retryable() || attempt >= self.policy.max_attempts {
                self.dump_markup(&job, &err);
                break JobOutcome::Failure { kind, message: err.message() };
            }
            if is_cancelled(&cancel) {
                break JobOutcome::Failure { kind, message: format!("cancelled before retry: {}", err.message()) };
            }

            let delay = self.policy.backoff(attempt);
            self.events.job(
                &job,
                JobState::Retrying,
                attempt,
                Some(format!("{} ; next attempt in {:?}", err.message(), delay)),
            );
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_cancelled(&mut cancel) => true,
            };
            if interrupted {
                break JobOutcome::Failure { kind, message: format!("cancelled before retry: {}", err.message()) };
            }
        };

        let (state, detail) = match &outcome {
            JobOutcome::Success(_) => (JobState::Succeeded, None),
            JobOutcome::PartialSuccess { missing, .. } => (JobState::PartiallySucceeded, Some(format!("missing {:?}", missing))),
            JobOutcome::Failure { kind, message } => (JobState::Failed, Some(format!("{}: {}", kind, message))),
        };
        self.events.job(&job, state, attempt, detail);

        JobResult {
            job,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: attempt,
            taxonomy,
        }
    }

    async fn attempt(&self, job: &FilingJob) -> Result<Extraction, AttemptError> {
        let rut = job.company.tax_id.number();
        let query = FilingQuery { period: job.period, consolidation: job.consolidation, standard: job.standard };

        // 1. Open the entity page
        self.gate.wait(rut).await;
        let mut guard = SessionGuard::open(self.factory.as_ref(), &job.company).await?;

        // 2. Submit the period form
        self.gate.wait(rut).await;
        let markup = match guard.session() {
            Ok(session) => session.select_period(query).await,
            Err(e) => Err(e),
        };
        guard.release().await;
        let markup = markup?;

        // 3. Detect and extract, without holding the parsed page across an await
        self.extract(&markup)
            .map_err(|error| AttemptError::Extract { error, markup })
    }

    fn extract(&self, markup: &str) -> Result<Extraction, ExtractError> {
        let document = Html::parse_document(markup);
        let taxonomy = self.detector.detect(&document)?;
        let statements = self.extractor.extract_all(&document, &taxonomy)?;
        Ok(Extraction { taxonomy: taxonomy.version_tag(), statements })
    }

    fn dump_markup(&self, job: &FilingJob, err: &AttemptError) {
        let (Some(dir), AttemptError::Extract { markup, .. }) = (&self.debug_dir, err) else {
            return;
        };
        let stem = format!("{}_{}_{:?}", job.company.tax_id.number(), job.period, err.kind());
        if let Err(e) = html_debug::dump_failed_markup(dir, &stem, markup) {
            tracing::warn!("Could not write debug dump for {}: {}", job.label(), e);
        }
    }
}

/// Three non-empty statements is a success, one or two a partial success, none a failure.
fn classify(statements: Vec<StatementExtract>) -> JobOutcome {
    let missing: Vec<StatementKind> = statements.iter().filter(|s| s.is_empty()).map(|s| s.kind).collect();
    let present: Vec<StatementExtract> = statements.into_iter().filter(|s| !s.is_empty()).collect();

    match present.len() {
        0 => JobOutcome::Failure {
            kind: ErrorKind::MalformedTable,
            message: "layout detected but no statement had any rows".to_string(),
        },
        3 => match <[StatementExtract; 3]>::try_from(present) {
            Ok(all) => JobOutcome::Success(Box::new(all)),
            Err(present) => JobOutcome::PartialSuccess { statements: present, missing },
        },
        _ => JobOutcome::PartialSuccess { statements: present, missing },
    }
}
