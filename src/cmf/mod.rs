// src/cmf/mod.rs
pub mod client;
pub mod models;
pub mod politeness;
pub mod roster;
pub mod session;

// Re-export the types most callers need
pub use client::HttpSessionFactory;
pub use models::{
    AccountingStandard, CompanyIdentity, Consolidation, FilingJob, Period, PeriodSet, TaxId, QUARTER_MONTHS,
};
pub use politeness::PolitenessGate;
pub use roster::load_roster;
pub use session::{FilingQuery, PageSession, SessionFactory, SessionGuard};
