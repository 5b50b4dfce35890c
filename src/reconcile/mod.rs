// src/reconcile/mod.rs
pub mod local_index;
pub mod remote_probe;

pub use local_index::{CorpusIndex, LocalCorpusIndex};
pub use remote_probe::{ProbeWindow, RemoteAvailabilityProbe};

use crate::cmf::models::{AccountingStandard, CompanyIdentity, Consolidation, FilingJob, PeriodSet};
use crate::config::ProbeConfig;
use crate::retrieval::job::cancelled;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// `missing` = remote minus local, `extra` = local minus remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeriodDiff {
    pub missing: PeriodSet,
    pub extra: PeriodSet,
}

impl PeriodDiff {
    pub fn is_in_sync(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Reconciliation outcome for one company.
#[derive(Debug, Clone, Serialize)]
pub struct CompanyReconciliation {
    pub company: CompanyIdentity,
    /// `None` when the company had nothing left to probe.
    pub window: Option<ProbeWindow>,
    pub local: PeriodSet,
    /// `None` when the probe failed; such a company has no diff.
    pub remote: Option<PeriodSet>,
    pub diff: Option<PeriodDiff>,
    pub probe_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Local>,
    pub companies: Vec<CompanyReconciliation>,
}

impl ReconciliationReport {
    /// New jobs for every missing period, newest first within each company and
    /// companies taken in turn. Extra periods are never turned into work.
    pub fn work_list(&self, consolidation: Consolidation, standard: AccountingStandard) -> Vec<FilingJob> {
        FilingJob::interleave(
            self.companies
                .iter()
                .filter_map(|c| c.diff.as_ref().map(|d| (&c.company, d)))
                .map(|(company, diff)| {
                    diff.missing
                        .iter()
                        .rev()
                        .map(|period| FilingJob::new(company.clone(), *period, consolidation, standard))
                        .collect()
                })
                .collect(),
        )
    }

    pub fn total_missing(&self) -> usize {
        self.companies.iter().filter_map(|c| c.diff.as_ref()).map(|d| d.missing.len()).sum()
    }

    pub fn total_extra(&self) -> usize {
        self.companies.iter().filter_map(|c| c.diff.as_ref()).map(|d| d.extra.len()).sum()
    }

    pub fn probe_failures(&self) -> usize {
        self.companies.iter().filter(|c| c.probe_error.is_some()).count()
    }
}

/// Diffs local captures against remote availability, company by company.
pub struct Reconciler {
    probe: Arc<RemoteAvailabilityProbe>,
    config: ProbeConfig,
}

impl Reconciler {
    pub fn new(probe: RemoteAvailabilityProbe, config: ProbeConfig) -> Self {
        Self { probe: Arc::new(probe), config }
    }

    /// Pure set difference in both directions.
    pub fn diff(local: &PeriodSet, remote: &PeriodSet) -> PeriodDiff {
        PeriodDiff {
            missing: remote.difference(local).copied().collect(),
            extra: local.difference(remote).copied().collect(),
        }
    }

    /// Probes every company (at most `max_concurrency` at once) and diffs each
    /// against the local periods inside its probe window. Companies not reached
    /// before cancellation are reported with a probe error.
    pub async fn reconcile_all(
        &self,
        companies: &[CompanyIdentity],
        local: &CorpusIndex,
        max_concurrency: usize,
        mut cancel: watch::Receiver<bool>,
    ) -> ReconciliationReport {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut results: Vec<CompanyReconciliation> = Vec::with_capacity(companies.len());

        for (position, company) in companies.iter().enumerate() {
            let local_periods = LocalCorpusIndex::periods_for(local, company);
            let window = ProbeWindow::for_company(&self.config, local_periods.iter().next_back().copied());

            let Some(window) = window else {
                tracing::info!("{}: nothing to probe", company);
                results.push(CompanyReconciliation {
                    company: company.clone(),
                    window: None,
                    local: local_periods,
                    remote: Some(PeriodSet::new()),
                    diff: Some(PeriodDiff::default()),
                    probe_error: None,
                });
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                for skipped in &companies[position..] {
                    results.push(CompanyReconciliation {
                        company: skipped.clone(),
                        window: None,
                        local: LocalCorpusIndex::periods_for(local, skipped),
                        remote: None,
                        diff: None,
                        probe_error: Some("not probed: run cancelled".to_string()),
                    });
                }
                break;
            };

            let probe = Arc::clone(&self.probe);
            let company = company.clone();
            tasks.spawn(async move {
                let remote = probe.scan(&company, window).await;
                drop(permit);
                let (remote, diff, probe_error) = match remote {
                    Ok(remote) => {
                        let diff = Reconciler::diff(&window.restrict(&local_periods), &remote);
                        (Some(remote), Some(diff), None)
                    }
                    Err(e) => (None, None, Some(e.to_string())),
                };
                CompanyReconciliation { company, window: Some(window), local: local_periods, remote, diff, probe_error }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Probe task ended abnormally: {}", e),
            }
        }
        results.sort_by(|a, b| a.company.cmp(&b.company));

        let report = ReconciliationReport { generated_at: Local::now(), companies: results };
        tracing::info!(
            "Reconciliation: {} companies, {} missing, {} extra, {} probe failures",
            report.companies.len(),
            report.total_missing(),
            report.total_extra(),
            report.probe_failures()
        );
        report
    }
}
