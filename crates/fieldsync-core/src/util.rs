//! Shared utility functions used across multiple modules.

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Read an environment-style value, trimming it and dropping empties.
pub fn lookup_trimmed(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn lookup_trimmed_drops_blank_values() {
        let lookup = |key: &str| match key {
            "SET" => Some("  value ".to_string()),
            "BLANK" => Some("   ".to_string()),
            _ => None,
        };
        assert_eq!(lookup_trimmed(&lookup, "SET").as_deref(), Some("value"));
        assert_eq!(lookup_trimmed(&lookup, "BLANK"), None);
        assert_eq!(lookup_trimmed(&lookup, "MISSING"), None);
    }
}
