// src/cmf/roster.rs
use crate::cmf::models::{CompanyIdentity, TaxId};
use crate::utils::error::StorageError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

// Header names as exported by the regulator's company listings, plus plain aliases.
#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(alias = "RUT", alias = "Rut")]
    rut: Option<String>,
    #[serde(rename = "rut_sin_guion", alias = "RUT_Sin_Guión", alias = "RUT_Sin_Guion")]
    rut_body: Option<String>,
    #[serde(rename = "razon_social", alias = "Razón Social", alias = "Razon Social", alias = "name")]
    name: Option<String>,
}

impl RosterRow {
    fn into_identity(self) -> Option<CompanyIdentity> {
        let tax_id = self
            .rut
            .as_deref()
            .and_then(|r| r.parse::<TaxId>().ok())
            .or_else(|| self.rut_body.as_deref().and_then(|r| r.parse::<TaxId>().ok()))?;
        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| tax_id.number().to_string());
        Some(CompanyIdentity::new(tax_id, name))
    }
}

/// Reads the company roster. Rows without a usable tax id are skipped with a
/// warning; duplicates keep their first occurrence.
pub fn load_roster<P: AsRef<Path>>(path: P) -> Result<Vec<CompanyIdentity>, StorageError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).flexible(true).from_path(path)?;

    let mut seen = HashSet::new();
    let mut companies = Vec::new();
    for (line, row) in reader.deserialize::<RosterRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Skipping roster row {}: {}", line + 2, e);
                continue;
            }
        };
        match row.into_identity() {
            Some(company) if seen.insert(company.tax_id.number()) => companies.push(company),
            Some(company) => tracing::debug!("Duplicate roster entry for {}", company.tax_id),
            None => tracing::warn!("Skipping roster row {}: no valid tax id", line + 2),
        }
    }

    tracing::info!("Loaded {} companies from {}", companies.len(), path.display());
    Ok(companies)
}
