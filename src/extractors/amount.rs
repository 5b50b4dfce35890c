// src/extractors/amount.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A single statement cell: an amount, or an explicit "not reported" (dash or blank).
/// Never conflated with zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValue {
    Reported(Decimal),
    NotReported,
}

impl CellValue {
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            CellValue::Reported(d) => Some(*d),
            CellValue::NotReported => None,
        }
    }
}

/// Separator convention of the rendering locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberLocale {
    pub thousands: char,
    pub decimal: char,
}

/// es-CL: `1.234.567,89`
pub const CHILEAN_LOCALE: NumberLocale = NumberLocale { thousands: '.', decimal: ',' };

const NOT_REPORTED_MARKERS: [&str; 6] = ["-", "—", "–", "‐", "−", "n/a"];

/// Parses a cell's text into a `CellValue`.
///
/// Accepts the locale's separators, and also the swapped convention when the text
/// makes it unambiguous (both separators present, or a single `.` not followed by
/// a three-digit group). Parentheses and a leading minus denote negatives.
pub fn parse_amount(raw: &str, locale: NumberLocale) -> Result<CellValue, String> {
    let text: String = raw
        .chars()
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .collect();
    let text = text.trim();

    if text.is_empty() || NOT_REPORTED_MARKERS.iter().any(|m| text.eq_ignore_ascii_case(m)) {
        return Ok(CellValue::NotReported);
    }

    let (negative, body) = if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        (true, &text[1..text.len() - 1])
    } else if let Some(rest) = text.strip_prefix('-').or_else(|| text.strip_prefix('−')) {
        (true, rest)
    } else {
        (false, text)
    };

    let compact: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$')
        .collect();
    if compact.is_empty() {
        return Err(format!("no digits in '{}'", raw));
    }

    let normalized = normalize_separators(&compact, locale)
        .ok_or_else(|| format!("unparseable amount '{}'", raw))?;
    let value = Decimal::from_str(&normalized)
        .map_err(|e| format!("unparseable amount '{}': {}", raw, e))?;

    Ok(CellValue::Reported(if negative { -value } else { value }))
}

fn normalize_separators(digits: &str, locale: NumberLocale) -> Option<String> {
    let last_thousands = digits.rfind(locale.thousands);
    let last_decimal = digits.rfind(locale.decimal);

    // Which character acts as the decimal point in this particular string
    let decimal_sep = match (last_thousands, last_decimal) {
        (Some(t), Some(d)) => Some(if d > t { locale.decimal } else { locale.thousands }),
        (None, Some(_)) => {
            if digits.matches(locale.decimal).count() > 1 {
                None
            } else {
                Some(locale.decimal)
            }
        }
        (Some(t), None) => {
            let tail = digits.len() - t - locale.thousands.len_utf8();
            if digits.matches(locale.thousands).count() == 1 && tail != 3 {
                Some(locale.thousands)
            } else {
                None
            }
        }
        (None, None) => None,
    };

    let mut out = String::with_capacity(digits.len());
    for c in digits.chars() {
        if Some(c) == decimal_sep {
            out.push('.');
        } else if c == locale.thousands || c == locale.decimal {
            continue;
        } else if c.is_ascii_digit() {
            out.push(c);
        } else {
            return None;
        }
    }

    if out.is_empty() || out == "." {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(s: &str) -> CellValue {
        parse_amount(s, CHILEAN_LOCALE).unwrap()
    }

    fn dec(s: &str) -> CellValue {
        CellValue::Reported(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn test_chilean_separators() {
        assert_eq!(amount("1.234.567"), dec("1234567"));
        assert_eq!(amount("1.234.567,89"), dec("1234567.89"));
        assert_eq!(amount("0,0123"), dec("0.0123"));
        assert_eq!(amount("12.345"), dec("12345"));
    }

    #[test]
    fn test_swapped_separators_when_unambiguous() {
        assert_eq!(amount("1,234,567.89"), dec("1234567.89"));
        assert_eq!(amount("1,234,567"), dec("1234567"));
        assert_eq!(amount("0.5"), dec("0.5"));
    }

    #[test]
    fn test_negatives() {
        assert_eq!(amount("(1.500)"), dec("-1500"));
        assert_eq!(amount("-1.500"), dec("-1500"));
        assert_eq!(amount("−20"), dec("-20"));
    }

    #[test]
    fn test_not_reported_is_not_zero() {
        assert_eq!(amount(""), CellValue::NotReported);
        assert_eq!(amount("\u{a0}"), CellValue::NotReported);
        assert_eq!(amount("-"), CellValue::NotReported);
        assert_eq!(amount(" — "), CellValue::NotReported);
        assert_eq!(amount("0"), dec("0"));
        assert_ne!(amount("-"), dec("0"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_amount("abc", CHILEAN_LOCALE).is_err());
        assert!(parse_amount("12a", CHILEAN_LOCALE).is_err());
        assert!(parse_amount("1,2,3.4,5", CHILEAN_LOCALE).is_err());
    }
}
