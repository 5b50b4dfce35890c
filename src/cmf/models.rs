// src/cmf/models.rs
use crate::utils::error::ConfigError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Months in which the regulator closes a reporting period.
pub const QUARTER_MONTHS: [u32; 4] = [3, 6, 9, 12];

/// Chilean tax id (RUT): body number plus optional verification digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId {
    number: u32,
    check_digit: Option<char>,
}

impl TaxId {
    pub fn new(number: u32) -> Self {
        Self { number, check_digit: Some(Self::compute_check_digit(number)) }
    }

    /// The body without the verification digit; this is what the entity page URL takes.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn check_digit(&self) -> Option<char> {
        self.check_digit
    }

    /// Modulo-11 verification digit.
    pub fn compute_check_digit(number: u32) -> char {
        let mut sum = 0u32;
        let mut factor = 2u32;
        let mut rest = number;
        while rest > 0 {
            sum += (rest % 10) * factor;
            rest /= 10;
            factor = if factor == 7 { 2 } else { factor + 1 };
        }
        match 11 - (sum % 11) {
            11 => '0',
            10 => 'K',
            d => char::from_digit(d, 10).unwrap_or('0'),
        }
    }
}

impl FromStr for TaxId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != '.' && !c.is_whitespace()).collect();
        let (body, dv) = match cleaned.split_once('-') {
            Some((body, dv)) => (body, Some(dv)),
            None => (cleaned.as_str(), None),
        };

        let number = body.parse::<u32>().map_err(|_| ConfigError::TaxId(s.to_string()))?;
        if number == 0 {
            return Err(ConfigError::TaxId(s.to_string()));
        }

        let check_digit = match dv {
            None => None,
            Some(dv) => {
                let mut chars = dv.chars();
                let digit = match (chars.next(), chars.next()) {
                    (Some(c), None) => c.to_ascii_uppercase(),
                    _ => return Err(ConfigError::TaxId(s.to_string())),
                };
                if digit != Self::compute_check_digit(number) {
                    return Err(ConfigError::TaxId(s.to_string()));
                }
                Some(digit)
            }
        };

        Ok(Self { number, check_digit })
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.check_digit {
            Some(dv) => write!(f, "{}-{}", self.number, dv),
            None => write!(f, "{}", self.number),
        }
    }
}

impl TryFrom<String> for TaxId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaxId> for String {
    fn from(value: TaxId) -> Self {
        value.to_string()
    }
}

/// A company as known to the roster. Identity is the tax id body alone;
/// the display name is carried along for folders and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyIdentity {
    pub tax_id: TaxId,
    pub name: String,
}

impl CompanyIdentity {
    pub fn new(tax_id: TaxId, name: impl Into<String>) -> Self {
        Self { tax_id, name: name.into() }
    }

    /// Folder-safe version of the display name.
    pub fn safe_name(&self) -> String {
        let mut out = String::with_capacity(self.name.len());
        for c in self.name.trim().chars() {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                out.push(c);
            } else if !out.ends_with('_') {
                out.push('_');
            }
        }
        out.trim_matches('_').to_string()
    }
}

impl PartialEq for CompanyIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.tax_id.number == other.tax_id.number
    }
}

impl Eq for CompanyIdentity {}

impl Hash for CompanyIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tax_id.number.hash(state);
    }
}

impl PartialOrd for CompanyIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompanyIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tax_id.number.cmp(&other.tax_id.number)
    }
}

impl fmt::Display for CompanyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.tax_id)
    }
}

/// One quarterly reporting date. Ordered chronologically; keyed as `YYYYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Period {
    year: i32,
    month: u32,
}

pub type PeriodSet = BTreeSet<Period>;

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if QUARTER_MONTHS.contains(&month) && (1900..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn from_key(key: u32) -> Option<Self> {
        Self::new((key / 100) as i32, key % 100)
    }

    pub fn key(&self) -> u32 {
        self.year as u32 * 100 + self.month
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 3 }
        } else {
            Self { year: self.year, month: self.month + 3 }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 3 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 3 }
        }
    }

    /// Last calendar day of the quarter.
    pub fn end_date(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 { (self.year + 1, 1) } else { (self.year, self.month + 1) };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MIN)
    }

    /// Newest period whose quarter has already closed on `date`.
    pub fn latest_closed_on(date: NaiveDate) -> Self {
        let candidate = Self {
            year: date.year(),
            month: QUARTER_MONTHS
                .iter()
                .copied()
                .filter(|m| *m <= date.month())
                .max()
                .unwrap_or(12),
        };
        let candidate = if candidate.month == 12 && date.month() < 3 {
            Self { year: date.year() - 1, month: 12 }
        } else {
            candidate
        };
        if candidate.end_date() <= date { candidate } else { candidate.prev() }
    }

    /// Every period of the given years whose month is in `months`, newest first.
    pub fn enumerate(start_year: i32, end_year: i32, months: &[u32]) -> Vec<Self> {
        let mut periods: Vec<Self> = (start_year..=end_year)
            .flat_map(|year| months.iter().filter_map(move |m| Self::new(year, *m)))
            .collect();
        periods.sort_unstable_by(|a, b| b.cmp(a));
        periods.dedup();
        periods
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 6 {
            return Err(ConfigError::Invalid(format!("period '{}' is not YYYYMM", s)));
        }
        trimmed
            .parse::<u32>()
            .ok()
            .and_then(Self::from_key)
            .ok_or_else(|| ConfigError::Invalid(format!("period '{}' is not a quarter close", s)))
    }
}

impl TryFrom<u32> for Period {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_key(value)
            .ok_or_else(|| ConfigError::Invalid(format!("period key {} is not a quarter close", value)))
    }
}

impl From<Period> for u32 {
    fn from(value: Period) -> Self {
        value.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Consolidation {
    Consolidated,
    Individual,
}

impl Consolidation {
    /// Visible text of the option in the regulator's form.
    pub fn form_label(&self) -> &'static str {
        match self {
            Consolidation::Consolidated => "Consolidado",
            Consolidation::Individual => "Individual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum AccountingStandard {
    IfrsFull,
    IfrsSimplified,
}

impl AccountingStandard {
    pub fn form_label(&self) -> &'static str {
        match self {
            AccountingStandard::IfrsFull => "Estándar IFRS",
            AccountingStandard::IfrsSimplified => "IFRS Simplificado",
        }
    }

    /// Does a visible option text denote this standard?
    pub fn matches_option(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let simplified = lower.contains("simplificad");
        match self {
            AccountingStandard::IfrsFull => lower.contains("ifrs") && !simplified,
            AccountingStandard::IfrsSimplified => simplified,
        }
    }
}

/// One retrieval attempt's worth of work: a company, a period and the filing flavour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingJob {
    pub company: CompanyIdentity,
    pub period: Period,
    pub consolidation: Consolidation,
    pub standard: AccountingStandard,
}

impl FilingJob {
    pub fn new(
        company: CompanyIdentity,
        period: Period,
        consolidation: Consolidation,
        standard: AccountingStandard,
    ) -> Self {
        Self { company, period, consolidation, standard }
    }

    /// Direct enumeration: every company crossed with every period, newest period first,
    /// companies taken in turn so consecutive jobs rarely share a company.
    pub fn enumerate(
        companies: &[CompanyIdentity],
        start_year: i32,
        end_year: i32,
        months: &[u32],
        consolidation: Consolidation,
        standard: AccountingStandard,
    ) -> Vec<Self> {
        let periods = Period::enumerate(start_year, end_year, months);
        Self::interleave(
            companies
                .iter()
                .map(|company| {
                    periods
                        .iter()
                        .map(|period| Self::new(company.clone(), *period, consolidation, standard))
                        .collect()
                })
                .collect(),
        )
    }

    /// Round-robin merge of per-company lists: the first job of each list, then the
    /// second of each, and so on. Order within a list is kept.
    pub fn interleave(per_company: Vec<Vec<Self>>) -> Vec<Self> {
        let total = per_company.iter().map(Vec::len).sum();
        let mut lanes: Vec<std::vec::IntoIter<Self>> = per_company.into_iter().map(Vec::into_iter).collect();
        let mut jobs = Vec::with_capacity(total);
        while jobs.len() < total {
            jobs.extend(lanes.iter_mut().filter_map(Iterator::next));
        }
        jobs
    }

    /// Short label used in log lines and summaries.
    pub fn label(&self) -> String {
        format!("{} {}", self.company.tax_id, self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_id_parsing_and_check_digit() {
        let rut: TaxId = "96.505.760-9".parse().unwrap();
        assert_eq!(rut.number(), 96505760);
        assert_eq!(rut.check_digit(), Some('9'));
        assert_eq!(rut.to_string(), "96505760-9");

        let bare: TaxId = "91041000".parse().unwrap();
        assert_eq!(bare.number(), 91041000);
        assert_eq!(bare.check_digit(), None);

        assert!("abc-1".parse::<TaxId>().is_err());
        let wrong = if TaxId::compute_check_digit(91041000) == '1' { '2' } else { '1' };
        assert!(format!("91041000-{}", wrong).parse::<TaxId>().is_err());
    }

    #[test]
    fn test_check_digit_known_values() {
        // 11.111.111-1 and 12.345.678-5 are textbook examples
        assert_eq!(TaxId::compute_check_digit(11111111), '1');
        assert_eq!(TaxId::compute_check_digit(12345678), '5');
    }

    #[test]
    fn test_company_identity_is_keyed_by_tax_id() {
        let a = CompanyIdentity::new(TaxId::new(91041000), "Viña San Pedro");
        let b = CompanyIdentity::new("91041000".parse().unwrap(), "VSPT");
        assert_eq!(a, b);
        assert_eq!(a.safe_name(), "Viña_San_Pedro");
    }

    #[test]
    fn test_period_key_and_ordering() {
        let p = Period::new(2024, 12).unwrap();
        assert_eq!(p.key(), 202412);
        assert_eq!(p.to_string(), "202412");
        assert_eq!(Period::from_key(202409), Period::new(2024, 9));
        assert!(Period::new(2024, 5).is_none());
        assert!(Period::from_key(202413).is_none());
        assert!(Period::new(2024, 3).unwrap() < Period::new(2024, 6).unwrap());
        assert!(Period::new(2023, 12).unwrap() < Period::new(2024, 3).unwrap());
        assert_eq!(p.next(), Period::new(2025, 3).unwrap());
        assert_eq!(Period::new(2025, 3).unwrap().prev(), p);
        assert!("2024-12".parse::<Period>().is_err());
        assert_eq!("202406".parse::<Period>().unwrap(), Period::new(2024, 6).unwrap());
    }

    #[test]
    fn test_latest_closed_period() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(Period::latest_closed_on(d(2024, 12, 31)), Period::new(2024, 12).unwrap());
        assert_eq!(Period::latest_closed_on(d(2024, 12, 30)), Period::new(2024, 9).unwrap());
        assert_eq!(Period::latest_closed_on(d(2025, 2, 10)), Period::new(2024, 12).unwrap());
        assert_eq!(Period::latest_closed_on(d(2025, 4, 1)), Period::new(2025, 3).unwrap());
        assert_eq!(Period::new(2024, 6).unwrap().end_date(), d(2024, 6, 30));
    }

    #[test]
    fn test_enumerate_jobs_newest_first() {
        let company = CompanyIdentity::new(TaxId::new(91041000), "A");
        let jobs = FilingJob::enumerate(
            &[company],
            2023,
            2024,
            &[6, 12],
            Consolidation::Consolidated,
            AccountingStandard::IfrsFull,
        );
        let keys: Vec<u32> = jobs.iter().map(|j| j.period.key()).collect();
        assert_eq!(keys, vec![202412, 202406, 202312, 202306]);
    }

    #[test]
    fn test_enumerate_takes_companies_in_turn() {
        let a = CompanyIdentity::new(TaxId::new(91041000), "A");
        let b = CompanyIdentity::new(TaxId::new(96505760), "B");
        let jobs = FilingJob::enumerate(
            &[a, b],
            2024,
            2024,
            &[3, 6, 12],
            Consolidation::Consolidated,
            AccountingStandard::IfrsFull,
        );
        let order: Vec<(u32, u32)> = jobs.iter().map(|j| (j.company.tax_id.number(), j.period.key())).collect();
        assert_eq!(
            order,
            vec![
                (91041000, 202412),
                (96505760, 202412),
                (91041000, 202406),
                (96505760, 202406),
                (91041000, 202403),
                (96505760, 202403),
            ]
        );
    }

    #[test]
    fn test_interleave_drains_uneven_lists() {
        let job = |rut: u32, key: u32| {
            FilingJob::new(
                CompanyIdentity::new(TaxId::new(rut), "X"),
                Period::from_key(key).unwrap(),
                Consolidation::Consolidated,
                AccountingStandard::IfrsFull,
            )
        };
        let jobs = FilingJob::interleave(vec![
            vec![job(1, 202412), job(1, 202409), job(1, 202406)],
            vec![],
            vec![job(3, 202412)],
        ]);
        let order: Vec<(u32, u32)> = jobs.iter().map(|j| (j.company.tax_id.number(), j.period.key())).collect();
        assert_eq!(order, vec![(1, 202412), (3, 202412), (1, 202409), (1, 202406)]);
    }

    #[test]
    fn test_standard_option_matching() {
        assert!(AccountingStandard::IfrsFull.matches_option("Estándar IFRS"));
        assert!(!AccountingStandard::IfrsFull.matches_option("IFRS Simplificado"));
        assert!(AccountingStandard::IfrsSimplified.matches_option("Norma IFRS simplificada"));
    }
}
