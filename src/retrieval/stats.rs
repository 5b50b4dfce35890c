// src/retrieval/stats.rs
use crate::retrieval::events::RunState;
use crate::retrieval::job::{JobOutcome, JobResult};
use crate::utils::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-job line of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub rut: String,
    pub company: String,
    pub period: u32,
    pub outcome: &'static str,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub taxonomy: Option<&'static str>,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Set when the result could not be written.
    pub persistence_error: Option<String>,
}

/// Aggregate view of a run. Counters only ever add, so arrival order does not matter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatistics {
    pub attempted: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed_by_kind: BTreeMap<ErrorKind, usize>,
    pub persistence_failures: usize,
    /// Jobs never started because the run was cancelled first.
    pub not_dispatched: usize,
    pub state: RunState,
    pub elapsed_ms: u64,
    pub jobs: Vec<JobRecord>,
}

impl RunStatistics {
    pub fn failed(&self) -> usize {
        self.failed_by_kind.values().sum()
    }

    /// Any job ended `Failed`, or produced data that could not be stored.
    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || self.persistence_failures > 0
    }

    pub fn record(&mut self, result: &JobResult, persistence_error: Option<String>) {
        self.attempted += 1;
        let (error_kind, message) = match &result.outcome {
            JobOutcome::Success(_) => {
                self.succeeded += 1;
                (None, None)
            }
            JobOutcome::PartialSuccess { missing, .. } => {
                self.partial += 1;
                (None, Some(format!("missing {:?}", missing)))
            }
            JobOutcome::Failure { kind, message } => {
                *self.failed_by_kind.entry(*kind).or_insert(0) += 1;
                (Some(*kind), Some(message.clone()))
            }
        };
        if persistence_error.is_some() {
            self.persistence_failures += 1;
        }

        self.jobs.push(JobRecord {
            rut: result.job.company.tax_id.to_string(),
            company: result.job.company.name.clone(),
            period: result.job.period.key(),
            outcome: result.outcome.label(),
            error_kind: error_kind.or(persistence_error.as_ref().map(|_| ErrorKind::PersistenceError)),
            message: message.or_else(|| persistence_error.clone()),
            taxonomy: result.taxonomy,
            attempts: result.attempts,
            duration_ms: result.duration_ms,
            persistence_error,
        });
    }

    /// Failed jobs, for the human-facing summary.
    pub fn failures(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.error_kind.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmf::models::{AccountingStandard, CompanyIdentity, Consolidation, FilingJob, Period, TaxId};

    fn result(outcome: JobOutcome) -> JobResult {
        JobResult {
            job: FilingJob::new(
                CompanyIdentity::new(TaxId::new(96505760), "Prueba"),
                Period::new(2024, 12).unwrap(),
                Consolidation::Consolidated,
                AccountingStandard::IfrsFull,
            ),
            outcome,
            duration_ms: 10,
            attempts: 1,
            taxonomy: None,
        }
    }

    #[test]
    fn test_record_counts_by_outcome_and_kind() {
        let mut stats = RunStatistics::default();
        stats.record(&result(JobOutcome::Failure { kind: ErrorKind::Timeout, message: "t".into() }), None);
        stats.record(&result(JobOutcome::Failure { kind: ErrorKind::Timeout, message: "t".into() }), None);
        stats.record(
            &result(JobOutcome::PartialSuccess { statements: vec![], missing: vec![] }),
            Some("disk full".into()),
        );

        assert_eq!(stats.attempted, 3);
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.failed_by_kind.get(&ErrorKind::Timeout), Some(&2));
        assert_eq!(stats.persistence_failures, 1);
        assert!(stats.has_failures());
        assert_eq!(stats.failures().count(), 3);
        assert_eq!(stats.jobs[2].error_kind, Some(ErrorKind::PersistenceError));
    }

    #[test]
    fn test_empty_run_has_no_failures() {
        let stats = RunStatistics::default();
        assert!(!stats.has_failures());
        assert_eq!(stats.state, RunState::Idle);
    }
}
