// src/cmf/politeness.rs
use crate::config::PolitenessConfig;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::sync::Arc;

/// Spacing between remote requests. Keyed by company tax id so that every request
/// for the same company waits at least `per_company`; an optional direct limiter
/// spaces every request of the run by `per_slot`.
#[derive(Clone)]
pub struct PolitenessGate {
    per_company: Option<Arc<DefaultKeyedRateLimiter<u32>>>,
    per_slot: Option<Arc<DefaultDirectRateLimiter>>,
}

impl PolitenessGate {
    pub fn new(config: PolitenessConfig) -> Self {
        // Quota::with_period yields None for a zero period: that limiter is disabled.
        let per_company = Quota::with_period(config.per_company).map(|q| Arc::new(RateLimiter::keyed(q)));
        let per_slot = config
            .per_slot
            .and_then(Quota::with_period)
            .map(|q| Arc::new(RateLimiter::direct(q)));
        Self { per_company, per_slot }
    }

    /// No waiting at all. Used by tests and dry runs.
    pub fn disabled() -> Self {
        Self { per_company: None, per_slot: None }
    }

    /// Waits until a request for `company` may go out.
    pub async fn wait(&self, company: u32) {
        if let Some(limiter) = &self.per_company {
            limiter.until_key_ready(&company).await;
        }
        if let Some(limiter) = &self.per_slot {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for PolitenessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolitenessGate")
            .field("per_company", &self.per_company.is_some())
            .field("per_slot", &self.per_slot.is_some())
            .finish()
    }
}
