// src/utils/html_debug.rs
use crate::utils::error::StorageError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

// Structural markers worth seeing at a glance when a page fails to extract.
static FINGERPRINT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"\[\d{6}\]").expect("Failed to compile role code pattern"), "role"),
        (
            Regex::new(r#"id\s*=\s*["']?(ESFC|ERF|ERN|EFEMD)\b"#).expect("Failed to compile container id pattern"),
            "container",
        ),
        (Regex::new(r"(?i)\[(sinopsis|abstract)\]").expect("Failed to compile abstract pattern"), "abstract"),
    ]
});

/// Saves markup with highlight spans inserted at the given byte ranges.
/// Overlapping ranges are dropped after the first.
pub fn save_debug_html(html: &str, path: &Path, highlights: &[(usize, usize, &str)]) -> Result<(), StorageError> {
    let mut debug_html = String::with_capacity(html.len() + 512);
    debug_html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<style>\n");
    debug_html.push_str(".highlight-role { background-color: #90EE90; }\n");
    debug_html.push_str(".highlight-container { background-color: #ADD8E6; }\n");
    debug_html.push_str(".highlight-abstract { background-color: #FFFF00; }\n");
    debug_html.push_str(".highlight-custom { background-color: #FFC0CB; }\n");
    debug_html.push_str("</style>\n</head>\n<body>\n");

    let mut sorted = highlights.to_vec();
    sorted.sort_by_key(|h| h.0);

    let mut last_pos = 0;
    for (start, end, highlight_type) in sorted {
        if start < last_pos || end > html.len() || !html.is_char_boundary(start) || !html.is_char_boundary(end) {
            continue;
        }
        debug_html.push_str(&html[last_pos..start]);
        let css_class = match highlight_type {
            "role" => "highlight-role",
            "container" => "highlight-container",
            "abstract" => "highlight-abstract",
            _ => "highlight-custom",
        };
        debug_html.push_str(&format!(
            "<span class=\"{}\" title=\"Position: {}-{}, Type: {}\">",
            css_class, start, end, highlight_type
        ));
        debug_html.push_str(&html[start..end]);
        debug_html.push_str("</span>");
        last_pos = end;
    }
    debug_html.push_str(&html[last_pos..]);
    debug_html.push_str("\n</body>\n</html>");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StorageError::IoError)?;
    }
    fs::write(path, debug_html).map_err(StorageError::IoError)?;
    tracing::info!("Saved debug HTML to {}", path.display());
    Ok(())
}

/// Byte ranges of every taxonomy fingerprint found in the markup.
pub fn fingerprint_highlights(html: &str) -> Vec<(usize, usize, &'static str)> {
    FINGERPRINT_PATTERNS
        .iter()
        .flat_map(|(re, kind)| re.find_iter(html).map(move |m| (m.start(), m.end(), *kind)))
        .collect()
}

/// Writes `<dir>/<stem>.html` with fingerprints highlighted and returns the path.
pub fn dump_failed_markup(dir: &Path, stem: &str, html: &str) -> Result<PathBuf, StorageError> {
    let path = dir.join(format!("{}.html", stem));
    save_debug_html(html, &path, &fingerprint_highlights(html))?;
    Ok(path)
}
