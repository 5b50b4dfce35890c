// src/storage/mod.rs
use crate::cmf::models::{CompanyIdentity, Period};
use crate::extractors::amount::CellValue;
use crate::extractors::table::{parse_column_key, ColumnKey, StatementExtract};
use crate::extractors::taxonomy::StatementKind;
use crate::reconcile::local_index::LocalCorpusIndex;
use crate::reconcile::ReconciliationReport;
use crate::retrieval::job::JobResult;
use crate::retrieval::orchestrator::ResultSink;
use crate::retrieval::stats::RunStatistics;
use crate::utils::error::StorageError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

// Leading columns of every statement CSV; value columns follow, one per date column.
const FIXED_HEADERS: [&str; 5] = ["order_index", "depth", "is_header", "concept_code", "label"];

/// Writes extraction results in the on-disk corpus convention
/// `<base>/<rut>_<name>/EEFF_<rut>_<YYYYMM>_extracted/`, and run artifacts to `summary_dir`.
pub struct StorageManager {
    base_dir: PathBuf,
    summary_dir: PathBuf,
}

impl StorageManager {
    /// Creates a new StorageManager, creating both directories if needed
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(base_dir: P, summary_dir: Q) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();
        let summary_path = summary_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(StorageError::IoError)?;
        fs::create_dir_all(&summary_path).map_err(StorageError::IoError)?;
        Ok(Self { base_dir: base_path, summary_dir: summary_path })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Folder of a company. An existing folder for the same tax id is reused,
    /// whatever display name it was created under.
    pub fn company_dir(&self, company: &CompanyIdentity) -> PathBuf {
        if let Ok(entries) = fs::read_dir(&self.base_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let same_company = LocalCorpusIndex::parse_company_dir(&name)
                    .map_or(false, |found| found.tax_id.number() == company.tax_id.number());
                if same_company && entry.path().is_dir() {
                    return entry.path();
                }
            }
        }
        self.base_dir.join(format!("{}_{}", company.tax_id, company.safe_name()))
    }

    pub fn period_dir(&self, company: &CompanyIdentity, period: Period) -> PathBuf {
        self.company_dir(company)
            .join(format!("EEFF_{}_{}_extracted", company.tax_id.number(), period))
    }

    /// Writes one CSV per extracted statement plus `meta.json`. Failures are not written.
    pub fn save_result(&self, result: &JobResult) -> Result<Option<PathBuf>, StorageError> {
        if !result.outcome.has_data() {
            return Ok(None);
        }
        let job = &result.job;
        let target_dir = self.period_dir(&job.company, job.period);
        fs::create_dir_all(&target_dir).map_err(StorageError::IoError)?;

        for statement in result.outcome.statements() {
            let path = target_dir.join(format!("{}.csv", statement.kind.file_stem()));
            write_statement_csv(&path, statement)?;
            tracing::debug!("Saved {} to {}", statement.kind, path.display());
        }

        let statements: Vec<serde_json::Value> = result
            .outcome
            .statements()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "kind": s.kind,
                    "source": s.source,
                    "headers": s.header_count(),
                    "leaves": s.leaf_count(),
                    "columns": s.columns.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                })
            })
            .collect();

        let metadata = serde_json::json!({
            "rut": job.company.tax_id,
            "company_name": job.company.name,
            "period": job.period,
            "consolidation": job.consolidation,
            "standard": job.standard,
            "outcome": result.outcome.label(),
            "taxonomy": result.taxonomy,
            "attempts": result.attempts,
            "duration_ms": result.duration_ms,
            "statements": statements,
            "extraction_timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let meta_path = target_dir.join("meta.json");
        write_json(&meta_path, &metadata)?;

        tracing::info!("Saved {} to {}", job.label(), target_dir.display());
        Ok(Some(target_dir))
    }

    /// Merges every stored period of a company into one table per statement kind,
    /// `<company>/EEFF_<rut>_<kind>.csv`, with date columns in chronological order.
    /// Row order follows the newest filing; rows only older filings have are
    /// inserted after their nearest preceding match.
    pub fn consolidate_company(&self, company: &CompanyIdentity) -> Result<Vec<PathBuf>, StorageError> {
        let company_dir = self.company_dir(company);
        let mut period_dirs: Vec<(Period, PathBuf)> = match fs::read_dir(&company_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    LocalCorpusIndex::parse_period_dir(&name).map(|p| (p, e.path()))
                })
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };
        period_dirs.sort_by(|a, b| b.0.cmp(&a.0));

        let mut written = Vec::new();
        for kind in StatementKind::ALL {
            let mut merged = MergedTable::default();
            for (_, dir) in &period_dirs {
                let path = dir.join(format!("{}.csv", kind.file_stem()));
                if path.exists() {
                    merged.absorb(read_statement_csv(&path)?);
                }
            }
            if merged.rows.is_empty() {
                continue;
            }
            let out = company_dir.join(format!("EEFF_{}_{}.csv", company.tax_id.number(), kind.file_stem()));
            merged.write(&out)?;
            tracing::info!("Consolidated {} ({} rows, {} columns) into {}", kind, merged.rows.len(), merged.columns.len(), out.display());
            written.push(out);
        }
        Ok(written)
    }

    /// `run_summary_<timestamp>.json` with every job of the run.
    pub fn save_run_summary(&self, stats: &RunStatistics) -> Result<PathBuf, StorageError> {
        let path = self.summary_dir.join(format!("run_summary_{}.json", timestamp()));
        write_json(&path, stats)?;
        tracing::info!("Saved run summary to {}", path.display());
        Ok(path)
    }

    /// `reconcile_summary_<timestamp>.{json,txt}`.
    pub fn save_reconcile_summary(&self, report: &ReconciliationReport) -> Result<(PathBuf, PathBuf), StorageError> {
        let stamp = timestamp();
        let json_path = self.summary_dir.join(format!("reconcile_summary_{}.json", stamp));
        write_json(&json_path, report)?;

        let txt_path = self.summary_dir.join(format!("reconcile_summary_{}.txt", stamp));
        fs::write(&txt_path, render_reconcile_text(report)).map_err(StorageError::IoError)?;

        tracing::info!("Saved reconciliation summary to {}", json_path.display());
        Ok((json_path, txt_path))
    }
}

#[async_trait]
impl ResultSink for StorageManager {
    async fn persist(&self, result: &JobResult) -> Result<(), StorageError> {
        self.save_result(result).map(|_| ())
    }
}

// --- Statement CSV ---

fn write_statement_csv(path: &Path, statement: &StatementExtract) -> Result<(), StorageError> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<String> = FIXED_HEADERS.iter().map(|h| h.to_string()).collect();
    header.extend(statement.columns.iter().map(|c| c.to_string()));
    writer.write_record(&header)?;

    for item in &statement.items {
        let mut record = vec![
            item.order_index.to_string(),
            item.depth.to_string(),
            item.is_category_header.to_string(),
            item.concept_code.clone().unwrap_or_default(),
            item.label.clone(),
        ];
        record.extend(statement.columns.iter().map(|c| cell_to_string(item.values.get(c))));
        writer.write_record(&record)?;
    }
    writer.flush().map_err(StorageError::IoError)?;
    Ok(())
}

fn cell_to_string(value: Option<&CellValue>) -> String {
    match value {
        Some(CellValue::Reported(amount)) => amount.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    depth: String,
    is_header: String,
    concept_code: String,
    label: String,
    /// How many earlier rows of the same filing share code and label.
    occurrence: usize,
    values: BTreeMap<ColumnKey, String>,
}

impl StoredRow {
    fn key(&self) -> (&str, &str, usize) {
        (self.concept_code.as_str(), self.label.as_str(), self.occurrence)
    }
}

fn read_statement_csv(path: &Path) -> Result<Vec<StoredRow>, StorageError> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<Option<ColumnKey>> = reader
        .headers()?
        .iter()
        .skip(FIXED_HEADERS.len())
        .map(parse_column_key)
        .collect();

    let mut rows = Vec::new();
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").to_string();
        let values = columns
            .iter()
            .enumerate()
            .filter_map(|(i, key)| {
                let key = (*key)?;
                let value = record.get(FIXED_HEADERS.len() + i)?;
                (!value.is_empty()).then(|| (key, value.to_string()))
            })
            .collect();
        let (concept_code, label) = (field(3), field(4));
        let count = seen.entry((concept_code.clone(), label.clone())).or_insert(0);
        let occurrence = *count;
        *count += 1;
        rows.push(StoredRow { depth: field(1), is_header: field(2), concept_code, label, occurrence, values });
    }
    Ok(rows)
}

#[derive(Debug, Default)]
struct MergedTable {
    columns: Vec<ColumnKey>,
    rows: Vec<StoredRow>,
}

impl MergedTable {
    /// Folds an older filing in. Values already present (from newer filings) win.
    /// A label repeated within one filing matches the same repetition in the others.
    fn absorb(&mut self, rows: Vec<StoredRow>) {
        let mut cursor = 0;
        for row in rows {
            match self.rows.iter().position(|r| r.key() == row.key()) {
                Some(pos) => {
                    for (column, value) in row.values {
                        self.rows[pos].values.entry(column).or_insert(value);
                    }
                    cursor = pos + 1;
                }
                None => {
                    self.rows.insert(cursor, row);
                    cursor += 1;
                }
            }
        }
        let mut columns: Vec<ColumnKey> = self.rows.iter().flat_map(|r| r.values.keys().copied()).collect();
        columns.sort();
        columns.dedup();
        self.columns = columns;
    }

    fn write(&self, path: &Path) -> Result<(), StorageError> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<String> = FIXED_HEADERS.iter().map(|h| h.to_string()).collect();
        header.extend(self.columns.iter().map(|c| c.to_string()));
        writer.write_record(&header)?;

        for (index, row) in self.rows.iter().enumerate() {
            let mut record = vec![
                index.to_string(),
                row.depth.clone(),
                row.is_header.clone(),
                row.concept_code.clone(),
                row.label.clone(),
            ];
            record.extend(self.columns.iter().map(|c| row.values.get(c).cloned().unwrap_or_default()));
            writer.write_record(&record)?;
        }
        writer.flush().map_err(StorageError::IoError)?;
        Ok(())
    }
}

// --- Helpers ---

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    fs::write(path, text).map_err(StorageError::IoError)
}

fn join_periods<'a>(periods: impl Iterator<Item = &'a Period>) -> String {
    let keys: Vec<String> = periods.map(|p| p.to_string()).collect();
    if keys.is_empty() { "-".to_string() } else { keys.join(", ") }
}

fn render_reconcile_text(report: &ReconciliationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Reconciliation summary ({})", report.generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(
        out,
        "Companies: {} | missing: {} | extra (review only): {} | probe failures: {}",
        report.companies.len(),
        report.total_missing(),
        report.total_extra(),
        report.probe_failures()
    );
    let _ = writeln!(out);
    for entry in &report.companies {
        let _ = writeln!(out, "{}", entry.company);
        if let Some(window) = &entry.window {
            let _ = writeln!(out, "  window:  {}..{}", window.from, window.to);
        }
        let _ = writeln!(out, "  local:   {}", join_periods(entry.local.iter()));
        match (&entry.diff, &entry.probe_error) {
            (Some(diff), _) => {
                let _ = writeln!(out, "  missing: {}", join_periods(diff.missing.iter()));
                let _ = writeln!(out, "  extra:   {}", join_periods(diff.extra.iter()));
            }
            (None, Some(err)) => {
                let _ = writeln!(out, "  probe error: {}", err);
            }
            (None, None) => {}
        }
    }
    out
}
