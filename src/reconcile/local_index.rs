// src/reconcile/local_index.rs
use crate::cmf::models::{CompanyIdentity, Period, PeriodSet, TaxId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// `<rut>_<name>`, rut with or without verification digit
static COMPANY_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,9}(?:-[0-9kK])?)_(.+)$").expect("Failed to compile COMPANY_DIR_RE")
});

// `..._YYYYMM_extracted`
static PERIOD_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"_(\d{6})_extracted$").expect("Failed to compile PERIOD_DIR_RE")
});

/// Periods captured per company, as found on disk.
pub type CorpusIndex = BTreeMap<CompanyIdentity, PeriodSet>;

/// Reads the on-disk corpus convention:
/// `<root>/<rut>_<name>/<anything>_<YYYYMM>_extracted/`.
#[derive(Debug, Clone)]
pub struct LocalCorpusIndex {
    root: PathBuf,
}

impl LocalCorpusIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parses a company folder name into its identity.
    pub fn parse_company_dir(name: &str) -> Option<CompanyIdentity> {
        let caps = COMPANY_DIR_RE.captures(name)?;
        let tax_id: TaxId = caps[1].parse().ok()?;
        Some(CompanyIdentity::new(tax_id, caps[2].replace('_', " ")))
    }

    /// Parses a period folder name, e.g. `EEFF_96505760_202412_extracted`.
    pub fn parse_period_dir(name: &str) -> Option<Period> {
        let caps = PERIOD_DIR_RE.captures(name)?;
        caps[1].parse::<Period>().ok()
    }

    /// Scans the whole corpus. Entries off-convention are logged and skipped;
    /// a missing root is an empty corpus.
    pub fn scan(&self) -> CorpusIndex {
        let mut index = CorpusIndex::new();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read corpus root {}: {}", self.root.display(), e);
                return index;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(company) = Self::parse_company_dir(&name) else {
                tracing::warn!("Skipping corpus entry not named <rut>_<name>: {}", path.display());
                continue;
            };

            let periods = Self::scan_company_dir(&path);
            tracing::debug!("{}: {} local period(s) in {}", company.tax_id, periods.len(), name);
            // Several folders for one tax id (renamed company) merge into one set.
            index.entry(company).or_default().extend(periods);
        }

        tracing::info!(
            "Local corpus at {}: {} companies, {} periods",
            self.root.display(),
            index.len(),
            index.values().map(|p| p.len()).sum::<usize>()
        );
        index
    }

    /// Periods for one company, looked up by tax id number.
    pub fn periods_for(index: &CorpusIndex, company: &CompanyIdentity) -> PeriodSet {
        index.get(company).cloned().unwrap_or_default()
    }

    fn scan_company_dir(dir: &Path) -> PeriodSet {
        let mut periods = PeriodSet::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read company folder {}: {}", dir.display(), e);
                return periods;
            }
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match Self::parse_period_dir(&name) {
                Some(period) => {
                    periods.insert(period);
                }
                None => tracing::warn!("Skipping folder without a valid period: {}", entry.path().display()),
            }
        }
        periods
    }
}
