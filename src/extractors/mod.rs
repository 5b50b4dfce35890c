// src/extractors/mod.rs
pub mod amount;
pub mod table;
pub mod taxonomy;

// Re-export key extraction types for convenience
pub use amount::{parse_amount, CellValue, NumberLocale, CHILEAN_LOCALE};
pub use table::{ColumnKey, HierarchicalTableExtractor, LineItem, StatementExtract};
pub use taxonomy::{Fingerprint, StatementKind, StatementLayout, TaxonomyDetector, TaxonomyKind};
