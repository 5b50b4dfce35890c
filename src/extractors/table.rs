// src/extractors/table.rs

// --- Imports ---
use crate::extractors::amount::{parse_amount, CellValue, NumberLocale, CHILEAN_LOCALE};
use crate::extractors::taxonomy::{locate_table, StatementKind, TaxonomyKind};
use crate::utils::error::ExtractError;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

// --- Constants ---
/// Coded layout indents one level per 20px of `padding-left`.
const CODED_PX_PER_LEVEL: f64 = 20.0;
/// Legacy layout indents one level per two leading non-breaking spaces.
const LEGACY_NBSP_PER_LEVEL: usize = 2;

/// Historical label renames, old label -> current label.
const CONCEPT_RENAMES: [(&str, &str); 6] = [
    ("Capital emitido", "Capital emitido y pagado"),
    ("Diferencias de cambio", "Ganancias (pérdidas) de cambio en moneda extranjera"),
    (
        "Flujos de efectivo netos procedentes de (utilizados en) la operación",
        "Flujos de efectivo netos procedentes de (utilizados en) operaciones",
    ),
    ("Pagos de préstamos a entidades relacionadas", "Pagos de préstamos de entidades relacionadas"),
    ("Pagos de pasivos por arrendamientos financieros", "Pagos de pasivos por arrendamientos"),
    (
        "Pagos por cambios en las participaciones en la propiedad en subsidiarias que no resulta en una pérdida de control",
        "Pagos por cambios en las participaciones en la propiedad en subsidiarias que no dan lugar a la pérdida de control",
    ),
];

// --- Selectors & Patterns (Lazy Static) ---
static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("tr").expect("Failed to compile ROW_SELECTOR")
});

static BOLD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("b, strong").expect("Failed to compile BOLD_SELECTOR")
});

static PADDING_LEFT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)padding-left\s*:\s*([^;]+)").expect("Failed to compile PADDING_LEFT_RE")
});

static LENGTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*(px|em)?\s*$").expect("Failed to compile LENGTH_RE")
});

static DATE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2})|(\d{2}[-/]\d{2}[-/]\d{4})").expect("Failed to compile DATE_TOKEN_RE")
});

static ABSTRACT_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\[\s*(sinopsis|abstract)\s*\]\s*$").expect("Failed to compile ABSTRACT_SUFFIX_RE")
});

// --- Data Structures ---

/// A value column of a statement. Income and cash-flow columns span a range;
/// balance columns are a single closing date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ColumnKey {
    pub end: NaiveDate,
    pub start: Option<NaiveDate>,
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "{}..{}", start, self.end),
            None => write!(f, "{}", self.end),
        }
    }
}

/// One row of a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub concept_code: Option<String>,
    pub label: String,
    pub depth: usize,
    pub is_category_header: bool,
    /// Position in the source table, starting at 0. Load-bearing: accounting
    /// categories are not sortable, the hierarchy is rebuilt from (depth, order_index).
    pub order_index: usize,
    #[serde(serialize_with = "serialize_by_column")]
    pub values: BTreeMap<ColumnKey, CellValue>,
}

/// Map keys go out in `ColumnKey`'s display form; JSON only takes string keys.
fn serialize_by_column<S, V>(values: &BTreeMap<ColumnKey, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    V: Serialize,
{
    serializer.collect_map(values.iter().map(|(column, value)| (column.to_string(), value)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementExtract {
    pub kind: StatementKind,
    /// Fingerprint code the table was located by, e.g. "210000" or "ESFC".
    pub source: String,
    /// Value columns, chronological.
    pub columns: Vec<ColumnKey>,
    pub items: Vec<LineItem>,
}

impl StatementExtract {
    pub fn empty(kind: StatementKind, source: impl Into<String>) -> Self {
        Self { kind, source: source.into(), columns: Vec::new(), items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn header_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_category_header).count()
    }

    pub fn leaf_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_category_header).count()
    }
}

/// Structural reading of one body row before depth is assigned.
#[derive(Debug)]
struct RowShape {
    header: bool,
    indent: usize,
    concept_code: Option<String>,
}

// --- Strategy Trait ---
/// Taxonomy-specific rule turning a row's first cell into a `RowShape`.
/// Classification is structural only; label text is never consulted.
trait RowClassifier {
    fn classify(&self, row: ElementRef, first_cell: ElementRef, has_values: bool) -> Result<RowShape, String>;

    /// When true, a leaf indented like the open header is its sibling; otherwise its child.
    fn indent_is_authoritative(&self) -> bool;
}

/// Coded layout: abstract flag in the class list, nesting in `padding-left`.
struct CodedRowClassifier;

impl RowClassifier for CodedRowClassifier {
    fn classify(&self, row: ElementRef, first_cell: ElementRef, has_values: bool) -> Result<RowShape, String> {
        let has_class = |el: ElementRef, class: &str| el.value().classes().any(|c| c.eq_ignore_ascii_case(class));
        let header = has_class(row, "abstract") || has_class(first_cell, "abstract");
        if header && has_values {
            return Err("abstract row carries reported amounts".to_string());
        }

        let indent = match first_cell.value().attr("style").and_then(|s| PADDING_LEFT_RE.captures(s)) {
            None => 0,
            Some(caps) => {
                let length = LENGTH_RE
                    .captures(&caps[1])
                    .ok_or_else(|| format!("unreadable indentation '{}'", &caps[1]))?;
                let amount: f64 = length[1].parse().map_err(|_| format!("unreadable indentation '{}'", &caps[1]))?;
                let per_level = match length.get(2).map(|u| u.as_str().to_ascii_lowercase()) {
                    Some(unit) if unit == "em" => 1.0,
                    _ => CODED_PX_PER_LEVEL,
                };
                (amount / per_level).round() as usize
            }
        };

        let concept_code = first_cell
            .value()
            .attr("data-concept")
            .or_else(|| first_cell.value().attr("title"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(RowShape { header, indent, concept_code })
    }

    fn indent_is_authoritative(&self) -> bool {
        true
    }
}

/// Legacy layout: fully bold first cell marks a header, leading NBSPs mark nesting.
struct LegacyRowClassifier;

impl RowClassifier for LegacyRowClassifier {
    fn classify(&self, _row: ElementRef, first_cell: ElementRef, has_values: bool) -> Result<RowShape, String> {
        let all_text: String = first_cell.text().collect();
        let visible = normalize_whitespace(&all_text);
        let bold_text: String = first_cell
            .select(&BOLD_SELECTOR)
            .flat_map(|b| b.text())
            .collect();
        let bold_visible = normalize_whitespace(&bold_text);

        let header = if bold_visible.is_empty() {
            false
        } else if bold_visible == visible {
            true
        } else {
            return Err(format!("partially bold label '{}'", visible));
        };
        if header && has_values {
            return Err(format!("bold header '{}' carries reported amounts", visible));
        }

        let leading_nbsp = all_text
            .chars()
            .take_while(|c| c.is_whitespace())
            .filter(|c| *c == '\u{a0}')
            .count();

        Ok(RowShape { header, indent: leading_nbsp / LEGACY_NBSP_PER_LEVEL, concept_code: None })
    }

    fn indent_is_authoritative(&self) -> bool {
        false
    }
}

// --- Extractor ---
#[derive(Debug, Clone)]
pub struct HierarchicalTableExtractor {
    locale: NumberLocale,
}

impl Default for HierarchicalTableExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HierarchicalTableExtractor {
    pub fn new() -> Self {
        Self { locale: CHILEAN_LOCALE }
    }

    pub fn with_locale(locale: NumberLocale) -> Self {
        Self { locale }
    }

    /// Extracts every primary statement the taxonomy locates. Kinds the layout lacks,
    /// or whose table is missing from the page, come back as empty extracts.
    pub fn extract_all(&self, document: &Html, taxonomy: &TaxonomyKind) -> Result<Vec<StatementExtract>, ExtractError> {
        StatementKind::ALL
            .iter()
            .map(|kind| self.extract(document, taxonomy, *kind))
            .collect()
    }

    /// Extracts one statement, preserving source row order and nesting.
    pub fn extract(
        &self,
        document: &Html,
        taxonomy: &TaxonomyKind,
        kind: StatementKind,
    ) -> Result<StatementExtract, ExtractError> {
        let fingerprint = match taxonomy.layout().locator(kind) {
            Some(fp) => fp,
            None => {
                tracing::debug!("{} not present in layout {}", kind, taxonomy.version_tag());
                return Ok(StatementExtract::empty(kind, ""));
            }
        };

        let table = match locate_table(document, taxonomy, fingerprint) {
            Some(table) => table,
            None => {
                tracing::warn!("Fingerprint {} detected but its table could not be located", fingerprint.code);
                return Ok(StatementExtract::empty(kind, fingerprint.code));
            }
        };

        let classifier: &dyn RowClassifier = match taxonomy {
            TaxonomyKind::IfrsCoded(_) => &CodedRowClassifier,
            TaxonomyKind::LegacyContainers(_) => &LegacyRowClassifier,
        };

        let mut extract = self.walk_table(table, classifier, kind, fingerprint.code)?;
        extract.columns.sort();
        tracing::debug!(
            "Extracted {} ({}): {} headers, {} leaves, {} columns",
            kind,
            fingerprint.code,
            extract.header_count(),
            extract.leaf_count(),
            extract.columns.len()
        );
        Ok(extract)
    }

    fn walk_table(
        &self,
        table: ElementRef,
        classifier: &dyn RowClassifier,
        kind: StatementKind,
        source: &str,
    ) -> Result<StatementExtract, ExtractError> {
        let malformed = |row_no: usize, reason: String| {
            ExtractError::MalformedTable(format!("{} [{}] row {}: {}", kind, source, row_no + 1, reason))
        };

        let mut extract = StatementExtract::empty(kind, source);
        // Columns in source order; `extract.columns` gets sorted at the end
        let mut source_columns: Vec<ColumnKey> = Vec::new();
        // Indentation of open category headers, outermost first
        let mut open_headers: Vec<usize> = Vec::new();
        let mut root_indent: Option<usize> = None;

        for (row_no, row) in table.select(&ROW_SELECTOR).enumerate() {
            if !belongs_to(row, table) {
                continue;
            }
            let cells: Vec<ElementRef> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| matches!(c.value().name(), "td" | "th"))
                .collect();
            if cells.is_empty() {
                continue;
            }

            // 1. Header rows (no data cells) may carry the date columns
            if cells.iter().all(|c| c.value().name() == "th") {
                if let Some(columns) = parse_columns(&cells[1..]) {
                    let mut seen = columns.clone();
                    seen.sort();
                    seen.dedup();
                    if seen.len() != columns.len() {
                        return Err(malformed(row_no, "duplicate date columns".to_string()));
                    }
                    source_columns = columns;
                    extract.columns = source_columns.clone();
                }
                continue;
            }

            let label_raw: String = cells[0].text().collect();
            let value_cells = &cells[1..];
            if normalize_whitespace(&label_raw).is_empty() && value_cells.iter().all(|c| cell_text(*c).is_empty()) {
                continue; // spacer row
            }

            // 2. Values, keyed by column
            if source_columns.is_empty() {
                return Err(malformed(row_no, "data row before any dated column header".to_string()));
            }
            if value_cells.len() != source_columns.len() {
                return Err(malformed(
                    row_no,
                    format!("{} value cells for {} columns", value_cells.len(), source_columns.len()),
                ));
            }
            let mut values = BTreeMap::new();
            for (column, cell) in source_columns.iter().zip(value_cells) {
                let value = parse_amount(&cell_text(*cell), self.locale).map_err(|e| malformed(row_no, e))?;
                values.insert(*column, value);
            }
            let has_values = values.values().any(|v| matches!(v, CellValue::Reported(_)));

            // 3. Structural classification
            let shape = classifier
                .classify(row, cells[0], has_values)
                .map_err(|e| malformed(row_no, e))?;
            let label = clean_label(&label_raw);
            if label.is_empty() {
                return Err(malformed(row_no, "amounts without a label".to_string()));
            }

            // 4. Depth from the stack of open headers
            let root = *root_indent.get_or_insert(shape.indent);
            if shape.indent < root {
                return Err(malformed(row_no, format!("'{}' is outdented past the statement root", label)));
            }
            let closes_at_same_indent = shape.header || classifier.indent_is_authoritative();
            while let Some(&top) = open_headers.last() {
                if top > shape.indent || (closes_at_same_indent && top == shape.indent) {
                    open_headers.pop();
                } else {
                    break;
                }
            }
            if !shape.header && extract.items.iter().all(|i| !i.is_category_header) {
                return Err(malformed(row_no, format!("leaf '{}' precedes every category header", label)));
            }

            extract.items.push(LineItem {
                concept_code: shape.concept_code,
                label,
                depth: open_headers.len(),
                is_category_header: shape.header,
                order_index: extract.items.len(),
                values,
            });
            if shape.header {
                open_headers.push(shape.indent);
            }
        }

        Ok(extract)
    }
}

// --- Helpers ---

/// True when `row`'s nearest enclosing table is `table` (skips nested tables).
fn belongs_to(row: ElementRef, table: ElementRef) -> bool {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
        .map_or(false, |owner| owner.id() == table.id())
}

fn parse_columns(cells: &[ElementRef]) -> Option<Vec<ColumnKey>> {
    if cells.is_empty() {
        return None;
    }
    cells.iter().map(|c| parse_column_key(&cell_text(*c))).collect()
}

/// Reads "31-12-2024", "2024-12-31" or a range like "01-01-2024 a 31-12-2024".
pub fn parse_column_key(text: &str) -> Option<ColumnKey> {
    let dates: Vec<NaiveDate> = DATE_TOKEN_RE
        .find_iter(text)
        .filter_map(|m| parse_date_token(m.as_str()))
        .collect();
    match dates.as_slice() {
        [end] => Some(ColumnKey { end: *end, start: None }),
        [start, end] if start < end => Some(ColumnKey { end: *end, start: Some(*start) }),
        _ => None,
    }
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
}

fn cell_text(cell: ElementRef) -> String {
    normalize_whitespace(&cell.text().collect::<String>())
}

fn normalize_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_label(raw: &str) -> String {
    let label = normalize_whitespace(raw);
    let label = ABSTRACT_SUFFIX_RE.replace(&label, "").to_string();
    CONCEPT_RENAMES
        .iter()
        .find(|(old, _)| *old == label)
        .map(|(_, new)| new.to_string())
        .unwrap_or(label)
}
