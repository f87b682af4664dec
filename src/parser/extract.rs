use once_cell::sync::Lazy;
use regex::Regex;

/// First number in a piece of free text, allowing thousands separators.
pub static NUMBER_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<value>[-+−]?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?)").unwrap()
});

/// Pull a numeric value out of `text` using `pattern`.
///
/// The named group `value` is used when present, otherwise group 1, otherwise
/// the whole match.
pub fn extract_number(text: &str, pattern: &Regex) -> Option<f64> {
    let caps = pattern.captures(text)?;
    let matched = caps
        .name("value")
        .or_else(|| caps.get(1))
        .or_else(|| caps.get(0))?;
    parse_number(matched.as_str())
}

/// Lenient numeric parse for values scraped from text: strips currency and
/// percent signs, footnote daggers, thousands separators and whitespace.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .replace('−', "-")
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%' | '†' | '_') && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern() {
        assert_eq!(extract_number("Closed at 1,234.50 USD", &NUMBER_IN_TEXT), Some(1234.5));
        assert_eq!(extract_number("change -0.75% today", &NUMBER_IN_TEXT), Some(-0.75));
        assert_eq!(extract_number("no figures here", &NUMBER_IN_TEXT), None);
    }

    #[test]
    fn test_custom_pattern_with_group() {
        let re = Regex::new(r"P/E ratio of (\d+\.\d+)").unwrap();
        assert_eq!(extract_number("S&P 500 has a P/E ratio of 31.52 as of Jan", &re), Some(31.52));
        assert_eq!(extract_number("P/E unavailable", &re), None);
    }

    #[test]
    fn test_named_group_wins() {
        let re = Regex::new(r"(\d{4}) volume: (?P<value>[\d,]+)").unwrap();
        assert_eq!(extract_number("2024 volume: 12,500", &re), Some(12500.0));
    }

    #[test]
    fn test_parse_number_cleanup() {
        assert_eq!(parse_number("† 31.52"), Some(31.52));
        assert_eq!(parse_number("$1,000"), Some(1000.0));
        assert_eq!(parse_number("−2.5"), Some(-2.5));
        assert_eq!(parse_number("."), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number(""), None);
    }
}
