// src/reconcile/remote_probe.rs
use crate::cmf::models::{AccountingStandard, CompanyIdentity, Consolidation, Period, PeriodSet};
use crate::cmf::politeness::PolitenessGate;
use crate::cmf::session::{FilingQuery, SessionFactory, SessionGuard};
use crate::config::{ProbeConfig, RetryPolicy};
use crate::utils::error::NavigationError;
use serde::Serialize;
use std::sync::Arc;

/// Inclusive range of periods probed for one company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeWindow {
    pub from: Period,
    pub to: Period,
}

impl ProbeWindow {
    pub fn new(from: Period, to: Period) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    /// Window for one company: the configured years, never past the newest closed
    /// quarter, at most `max_lookback_quarters` long (0 means unbounded). In
    /// incremental mode it starts after the newest local period.
    /// `None` when there is nothing to probe.
    pub fn for_company(config: &ProbeConfig, newest_local: Option<Period>) -> Option<Self> {
        let first = Period::new(config.start_year, 3)?;
        let last = Period::new(config.end_year, 12)?;
        let to = last.min(Period::latest_closed_on(config.as_of));

        let mut from = first;
        if config.incremental {
            if let Some(newest) = newest_local {
                from = from.max(newest.next());
            }
        }
        if config.max_lookback_quarters > 0 {
            let mut floor = to;
            for _ in 1..config.max_lookback_quarters {
                floor = floor.prev();
            }
            from = from.max(floor);
        }
        Self::new(from, to)
    }

    pub fn contains(&self, period: Period) -> bool {
        self.from <= period && period <= self.to
    }

    /// Every period of the window, oldest first.
    pub fn periods(&self) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut current = self.from;
        while current <= self.to {
            periods.push(current);
            current = current.next();
        }
        periods
    }

    /// The part of `set` this window covers.
    pub fn restrict(&self, set: &PeriodSet) -> PeriodSet {
        set.range(self.from..=self.to).copied().collect()
    }
}

/// Finds which periods the regulator links a filing for, without extracting anything.
pub struct RemoteAvailabilityProbe {
    factory: Arc<dyn SessionFactory>,
    gate: PolitenessGate,
    policy: RetryPolicy,
    consolidation: Consolidation,
    standard: AccountingStandard,
}

impl RemoteAvailabilityProbe {
    pub fn new(factory: Arc<dyn SessionFactory>, gate: PolitenessGate, policy: RetryPolicy) -> Self {
        Self {
            factory,
            gate,
            policy,
            consolidation: Consolidation::Consolidated,
            standard: AccountingStandard::IfrsFull,
        }
    }

    pub fn with_filing_type(mut self, consolidation: Consolidation, standard: AccountingStandard) -> Self {
        self.consolidation = consolidation;
        self.standard = standard;
        self
    }

    /// One presence check per period of the window, newest first, over a single
    /// session. Transient failures reopen the session and resume where it stopped;
    /// the retry budget resets whenever a period gets through.
    pub async fn scan(&self, company: &CompanyIdentity, window: ProbeWindow) -> Result<PeriodSet, NavigationError> {
        let mut pending = window.periods();
        let mut available = PeriodSet::new();
        let mut failures = 0u32;

        tracing::info!(
            "Probing {} for {} period(s) {}..{}",
            company,
            pending.len(),
            window.from,
            window.to
        );

        while !pending.is_empty() {
            let before = pending.len();
            let err = match self.probe_pending(company, &mut pending, &mut available).await {
                Ok(()) => break,
                Err(err) => err,
            };
            if pending.len() < before {
                failures = 0;
            }
            failures += 1;
            if !err.kind().is_retryable() || failures >= self.policy.max_attempts {
                tracing::warn!("Probe for {} failed: {}", company.tax_id, err);
                return Err(err);
            }
            let delay = self.policy.backoff(failures);
            tracing::warn!("Probe for {} interrupted ({}), resuming in {:?}", company.tax_id, err, delay);
            tokio::time::sleep(delay).await;
        }

        tracing::info!("{}: {} period(s) available remotely", company.tax_id, available.len());
        Ok(available)
    }

    async fn probe_pending(
        &self,
        company: &CompanyIdentity,
        pending: &mut Vec<Period>,
        available: &mut PeriodSet,
    ) -> Result<(), NavigationError> {
        let rut = company.tax_id.number();
        self.gate.wait(rut).await;
        let mut guard = SessionGuard::open(self.factory.as_ref(), company).await?;

        let result = async {
            while let Some(&period) = pending.last() {
                self.gate.wait(rut).await;
                let query = FilingQuery { period, consolidation: self.consolidation, standard: self.standard };
                if guard.session()?.probe_link_presence(query).await? {
                    available.insert(period);
                }
                tracing::trace!("Probed {} {}", company.tax_id, period);
                pending.pop();
            }
            Ok::<(), NavigationError>(())
        }
        .await;

        guard.release().await;
        result
    }
}
