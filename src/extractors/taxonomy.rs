// src/extractors/taxonomy.rs

// --- Imports ---
use crate::utils::error::ExtractError;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::fmt;

// --- CSS Selectors (Lazy Static) ---
// Header cells that may carry a role code like "[210000] Estado de situación financiera"
static TABLE_HEADER_CELL_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("table th, table td").expect("Failed to compile TABLE_HEADER_CELL_SELECTOR")
});

static ID_CARRIER_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("[id]").expect("Failed to compile ID_CARRIER_SELECTOR")
});

static TABLE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("table").expect("Failed to compile TABLE_SELECTOR")
});

// --- Regex Patterns ---
static ROLE_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(\d{6})\]").expect("Failed to compile ROLE_CODE_RE")
});

// --- Data Structures ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub enum StatementKind {
    Balance,
    Income,
    CashFlow,
}

impl StatementKind {
    pub const ALL: [StatementKind; 3] = [StatementKind::Balance, StatementKind::Income, StatementKind::CashFlow];

    pub fn file_stem(&self) -> &'static str {
        match self {
            StatementKind::Balance => "balance",
            StatementKind::Income => "income",
            StatementKind::CashFlow => "cash_flow",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatementKind::Balance => "Balance General",
            StatementKind::Income => "Estado de Resultados",
            StatementKind::CashFlow => "Estado de Flujo de Efectivo",
        })
    }
}

/// A structural marker that locates one statement table in a filing page.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub code: &'static str,
    pub kind: StatementKind,
    pub description: &'static str,
}

/// Role codes of the coded IFRS rendering, in preference order per statement kind.
pub static IFRS_ROLE_FINGERPRINTS: [Fingerprint; 6] = [
    Fingerprint { code: "210000", kind: StatementKind::Balance, description: "Estado de situación financiera, corriente/no corriente" },
    Fingerprint { code: "220000", kind: StatementKind::Balance, description: "Estado de situación financiera, orden de liquidez" },
    Fingerprint { code: "310000", kind: StatementKind::Income, description: "Estado del resultado, por función de gasto" },
    Fingerprint { code: "320000", kind: StatementKind::Income, description: "Estado del resultado, por naturaleza de gasto" },
    Fingerprint { code: "510000", kind: StatementKind::CashFlow, description: "Estado de flujos de efectivo, método directo" },
    Fingerprint { code: "520000", kind: StatementKind::CashFlow, description: "Estado de flujos de efectivo, método indirecto" },
];

/// Container ids of the pre-coded rendering.
pub static LEGACY_CONTAINER_FINGERPRINTS: [Fingerprint; 4] = [
    Fingerprint { code: "ESFC", kind: StatementKind::Balance, description: "Estado de situación financiera clasificado" },
    Fingerprint { code: "ERF", kind: StatementKind::Income, description: "Estado de resultados por función" },
    Fingerprint { code: "ERN", kind: StatementKind::Income, description: "Estado de resultados por naturaleza" },
    Fingerprint { code: "EFEMD", kind: StatementKind::CashFlow, description: "Estado de flujo de efectivo método directo" },
];

/// Which fingerprint (if any) locates each statement kind in one filing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatementLayout {
    pub balance: Option<&'static Fingerprint>,
    pub income: Option<&'static Fingerprint>,
    pub cash_flow: Option<&'static Fingerprint>,
}

impl StatementLayout {
    pub fn locator(&self, kind: StatementKind) -> Option<&'static Fingerprint> {
        match kind {
            StatementKind::Balance => self.balance,
            StatementKind::Income => self.income,
            StatementKind::CashFlow => self.cash_flow,
        }
    }

    pub fn present_count(&self) -> usize {
        StatementKind::ALL.iter().filter(|k| self.locator(**k).is_some()).count()
    }

    fn from_matches(table: &'static [Fingerprint], found: impl Fn(&str) -> bool) -> Self {
        let pick = |kind: StatementKind| table.iter().filter(|fp| fp.kind == kind).find(|fp| found(fp.code));
        Self {
            balance: pick(StatementKind::Balance),
            income: pick(StatementKind::Income),
            cash_flow: pick(StatementKind::CashFlow),
        }
    }
}

/// Table layout a filing was published under. Closed set; each variant has its own
/// row classification strategy in the table extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaxonomyKind {
    /// Role-coded IFRS rendering: statements introduced by a `[NNNNNN]` header cell,
    /// abstract rows flagged by class, nesting by `padding-left`.
    IfrsCoded(StatementLayout),
    /// Older rendering: statements inside containers with fixed ids,
    /// headers in bold, nesting by leading non-breaking spaces.
    LegacyContainers(StatementLayout),
}

impl TaxonomyKind {
    pub fn layout(&self) -> &StatementLayout {
        match self {
            TaxonomyKind::IfrsCoded(layout) | TaxonomyKind::LegacyContainers(layout) => layout,
        }
    }

    pub fn version_tag(&self) -> &'static str {
        match self {
            TaxonomyKind::IfrsCoded(_) => "ifrs-coded/v1",
            TaxonomyKind::LegacyContainers(_) => "legacy-containers/v1",
        }
    }
}

// --- Detector ---
#[derive(Debug, Default, Clone, Copy)]
pub struct TaxonomyDetector;

impl TaxonomyDetector {
    pub fn new() -> Self {
        Self
    }

    /// Determines the taxonomy layout of a parsed filing page.
    /// Unrecognized pages are an error, never a default.
    pub fn detect(&self, document: &Html) -> Result<TaxonomyKind, ExtractError> {
        // 1. Role-coded rendering takes precedence when any primary role code is present
        let role_codes = Self::role_codes_in(document);
        let coded = StatementLayout::from_matches(&IFRS_ROLE_FINGERPRINTS, |code| {
            role_codes.iter().any(|c| c == code)
        });
        if coded.present_count() > 0 {
            tracing::debug!("Detected coded IFRS layout with roles {:?}", role_codes);
            return Ok(TaxonomyKind::IfrsCoded(coded));
        }

        // 2. Legacy container ids
        let ids: Vec<String> = document
            .select(&ID_CARRIER_SELECTOR)
            .filter_map(|el| el.value().id().map(str::to_string))
            .collect();
        let legacy = StatementLayout::from_matches(&LEGACY_CONTAINER_FINGERPRINTS, |code| {
            ids.iter().any(|id| id == code)
        });
        if legacy.present_count() > 0 {
            tracing::debug!("Detected legacy container layout");
            return Ok(TaxonomyKind::LegacyContainers(legacy));
        }

        // 3. Nothing we know how to read
        if role_codes.is_empty() {
            Err(ExtractError::UnknownTaxonomy("no known statement fingerprint in page".to_string()))
        } else {
            Err(ExtractError::UnknownTaxonomy(format!(
                "role codes {:?} include no primary statement",
                role_codes
            )))
        }
    }

    /// Convenience wrapper over raw markup.
    pub fn detect_markup(&self, markup: &str) -> Result<TaxonomyKind, ExtractError> {
        self.detect(&Html::parse_document(markup))
    }

    fn role_codes_in(document: &Html) -> Vec<String> {
        let mut codes = Vec::new();
        for cell in document.select(&TABLE_HEADER_CELL_SELECTOR) {
            let text = cell.text().collect::<String>();
            for caps in ROLE_CODE_RE.captures_iter(&text) {
                let code = caps[1].to_string();
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
        codes
    }
}

/// Finds the table a fingerprint points at, if the page has it.
pub fn locate_table<'a>(document: &'a Html, taxonomy: &TaxonomyKind, fingerprint: &Fingerprint) -> Option<ElementRef<'a>> {
    match taxonomy {
        TaxonomyKind::IfrsCoded(_) => {
            let marker = format!("[{}]", fingerprint.code);
            document
                .select(&TABLE_HEADER_CELL_SELECTOR)
                .find(|cell| cell.text().collect::<String>().contains(&marker))
                .and_then(|cell| {
                    cell.ancestors()
                        .filter_map(ElementRef::wrap)
                        .find(|el| el.value().name() == "table")
                })
        }
        TaxonomyKind::LegacyContainers(_) => document
            .select(&ID_CARRIER_SELECTOR)
            .find(|el| el.value().id() == Some(fingerprint.code))
            .and_then(|container| {
                if container.value().name() == "table" {
                    Some(container)
                } else {
                    container.select(&TABLE_SELECTOR).next()
                }
            }),
    }
}

// --- Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_coded_layout_with_preference_order() {
        let html = r#"<html><body>
            <table><tr><th>[210000] Estado de situación financiera</th></tr></table>
            <table><tr><th>[320000] Estado del resultado por naturaleza</th></tr></table>
            <table><tr><th>[310000] Estado del resultado por función</th></tr></table>
            <table><tr><th>[520000] Flujos indirecto</th></tr></table>
        </body></html>"#;
        let taxonomy = TaxonomyDetector::new().detect_markup(html).unwrap();
        let layout = match taxonomy {
            TaxonomyKind::IfrsCoded(layout) => layout,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(layout.balance.map(|f| f.code), Some("210000"));
        assert_eq!(layout.income.map(|f| f.code), Some("310000"));
        assert_eq!(layout.cash_flow.map(|f| f.code), Some("520000"));
    }

    #[test]
    fn test_detects_legacy_containers() {
        let html = r#"<div id="ESFC"><table></table></div><div id="ERN"><table></table></div>"#;
        let taxonomy = TaxonomyDetector::new().detect_markup(html).unwrap();
        assert!(matches!(taxonomy, TaxonomyKind::LegacyContainers(_)));
        assert_eq!(taxonomy.layout().present_count(), 2);
        assert_eq!(taxonomy.layout().income.map(|f| f.code), Some("ERN"));
        assert_eq!(taxonomy.layout().cash_flow, None);
    }

    #[test]
    fn test_unknown_page_is_an_error() {
        let detector = TaxonomyDetector::new();
        let err = detector.detect_markup("<html><body><p>Sin información</p></body></html>").unwrap_err();
        assert!(matches!(err, ExtractError::UnknownTaxonomy(_)));

        // Only a non-primary role (changes in equity) is present
        let err = detector
            .detect_markup("<table><tr><th>[610000] Cambios en el patrimonio</th></tr></table>")
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnknownTaxonomy(msg) if msg.contains("610000")));
    }

    #[test]
    fn test_locate_table_for_each_layout() {
        let coded = Html::parse_document(
            r#"<table id="t1"><tr><th>[210000] Balance</th></tr></table><table id="t2"><tr><th>[310000] R</th></tr></table>"#,
        );
        let taxonomy = TaxonomyDetector::new().detect(&coded).unwrap();
        let fp = taxonomy.layout().income.unwrap();
        let table = locate_table(&coded, &taxonomy, fp).unwrap();
        assert_eq!(table.value().id(), Some("t2"));

        let legacy = Html::parse_document(r#"<div id="EFEMD"><p>x</p><table class="flujo"></table></div>"#);
        let taxonomy = TaxonomyDetector::new().detect(&legacy).unwrap();
        let fp = taxonomy.layout().cash_flow.unwrap();
        let table = locate_table(&legacy, &taxonomy, fp).unwrap();
        assert_eq!(table.value().attr("class"), Some("flujo"));
    }
}
