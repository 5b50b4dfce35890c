// src/cmf/session.rs
use crate::cmf::models::{AccountingStandard, CompanyIdentity, Consolidation, Period};
use crate::utils::error::NavigationError;
use async_trait::async_trait;

/// What to ask the entity form for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilingQuery {
    pub period: Period,
    pub consolidation: Consolidation,
    pub standard: AccountingStandard,
}

/// One remote navigation context for one company. Not shared between workers.
#[async_trait]
pub trait PageSession: Send {
    /// Fills the period form, submits it and returns the statements page markup.
    async fn select_period(&mut self, query: FilingQuery) -> Result<String, NavigationError>;

    /// Cheap availability check: does the regulator link a filing for this period?
    async fn probe_link_presence(&mut self, query: FilingQuery) -> Result<bool, NavigationError>;

    /// Display name as shown by the regulator, if the entity page carried one.
    fn display_name(&self) -> Option<&str> {
        None
    }

    /// Releases the underlying context.
    async fn close(self: Box<Self>);
}

/// Opens navigation contexts. Implementations own whatever is shared between sessions
/// (drivers, connection pools) and nothing that carries per-session state.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, company: &CompanyIdentity) -> Result<Box<dyn PageSession>, NavigationError>;
}

/// Scoped session: released explicitly via `release`, or on drop if the holder
/// bails out early (error, cancellation of the enclosing future, panic).
pub struct SessionGuard {
    session: Option<Box<dyn PageSession>>,
    label: String,
}

impl SessionGuard {
    pub async fn open(factory: &dyn SessionFactory, company: &CompanyIdentity) -> Result<Self, NavigationError> {
        let session = factory.open(company).await?;
        tracing::trace!("Session opened for {}", company.tax_id);
        Ok(Self { session: Some(session), label: company.tax_id.to_string() })
    }

    pub fn session(&mut self) -> Result<&mut (dyn PageSession + 'static), NavigationError> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| NavigationError::ElementNotFound("session already released".to_string()))
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            tracing::trace!("Session released for {}", self.label);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    tracing::debug!("Releasing session for {} from drop", self.label);
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => tracing::warn!("No runtime to release session for {}", self.label),
            }
        }
    }
}
