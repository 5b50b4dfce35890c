// src/config.rs
use crate::cmf::models::{AccountingStandard, Consolidation, QUARTER_MONTHS};
use crate::utils::error::ConfigError;
use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Regulator entity page; `{rut}` is replaced with the tax id body.
pub const DEFAULT_ENTITY_URL: &str = "https://www.cmfchile.cl/institucional/mercados/entidad.php?mercado=V&rut={rut}&grupo=&tipoentidad=RVEMI&row=AAAwy2ACTAAABy2AAC&vig=VI&control=svs&pestania=3";
pub const DEFAULT_USER_AGENT: &str = "cmf_extractor/0.1 (financial statements research)";

/// Every tunable of a run. Loaded from a JSON file and/or overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub start_year: i32,
    pub end_year: i32,
    /// Quarter-closing months to retrieve, subset of {3, 6, 9, 12}.
    pub months: Vec<u32>,
    pub consolidation: Consolidation,
    pub standard: AccountingStandard,
    pub max_concurrency: usize,
    pub headless: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub step_timeout_secs: u64,
    /// Minimum spacing between two requests for the same company.
    pub politeness_ms: u64,
    /// Optional minimum spacing between any two requests of the run.
    pub slot_politeness_ms: Option<u64>,
    pub max_lookback_quarters: usize,
    /// Probe only periods newer than the newest local one.
    pub incremental_probe: bool,
    pub output_dir: PathBuf,
    pub summary_dir: PathBuf,
    pub base_url: String,
    pub user_agent: String,
    pub debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let this_year = Local::now().year();
        Self {
            start_year: this_year - 5,
            end_year: this_year,
            months: QUARTER_MONTHS.to_vec(),
            consolidation: Consolidation::Consolidated,
            standard: AccountingStandard::IfrsFull,
            max_concurrency: 4,
            headless: true,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            step_timeout_secs: 15,
            politeness_ms: 1_500,
            slot_politeness_ms: None,
            max_lookback_quarters: 40,
            incremental_probe: false,
            output_dir: PathBuf::from("./data/EEFF"),
            summary_dir: PathBuf::from("./output"),
            base_url: DEFAULT_ENTITY_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            debug: false,
        }
    }
}

impl RunConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: RunConfig = serde_json::from_str(&text)?;
        tracing::debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_year > self.end_year {
            return Err(ConfigError::Invalid(format!(
                "start year {} is after end year {}",
                self.start_year, self.end_year
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".to_string()));
        }
        if self.months.is_empty() || self.months.iter().any(|m| !QUARTER_MONTHS.contains(m)) {
            return Err(ConfigError::Invalid(format!(
                "months {:?} must be a non-empty subset of {:?}",
                self.months, QUARTER_MONTHS
            )));
        }
        if !self.base_url.contains("{rut}") {
            return Err(ConfigError::Invalid("base url needs a {rut} placeholder".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.base_url.clone(),
            user_agent: self.user_agent.clone(),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            headless: self.headless,
        }
    }

    pub fn politeness_config(&self) -> PolitenessConfig {
        PolitenessConfig {
            per_company: Duration::from_millis(self.politeness_ms),
            per_slot: self.slot_politeness_ms.map(Duration::from_millis),
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            start_year: self.start_year,
            end_year: self.end_year,
            max_lookback_quarters: self.max_lookback_quarters,
            incremental: self.incremental_probe,
            as_of: Local::now().date_naive(),
        }
    }
}

/// How a job reacts to retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RunConfig::default().retry_policy()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Per navigation step (page load, form submit), not per job.
    pub step_timeout: Duration,
    /// The HTTP session never renders; kept so a rendering backend can honour it.
    pub headless: bool,
}

impl SessionConfig {
    pub fn entity_url(&self, rut_number: u32) -> String {
        self.base_url.replace("{rut}", &rut_number.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolitenessConfig {
    pub per_company: Duration,
    pub per_slot: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub start_year: i32,
    pub end_year: i32,
    pub max_lookback_quarters: usize,
    pub incremental: bool,
    pub as_of: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RunConfig { start_year: 2025, end_year: 2020, ..RunConfig::default() };
        assert!(config.validate().is_err());
        config.end_year = 2025;
        config.max_concurrency = 0;
        assert!(config.validate().is_err());
        config.max_concurrency = 2;
        config.months = vec![5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"max_concurrency": 8, "start_year": 2015}"#).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.start_year, 2015);
        assert_eq!(config.max_attempts, 3);
        assert!(config.headless);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_entity_url_substitution() {
        let session = RunConfig::default().session_config();
        assert!(session.entity_url(96505760).contains("rut=96505760&"));
    }
}
