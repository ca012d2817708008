use chrono::{DateTime, Utc};

/// Truncate a string to a maximum number of characters, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format an optional string, returning a default if None or blank
pub fn format_optional(value: &Option<String>, default: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// Short date for listings, `-` when unknown
pub fn format_timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|dt| dt.format("%b %d, %Y").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        assert_eq!(truncate_string("Ação solidária", 6), "Açã...");
    }

    #[test]
    fn test_format_optional() {
        assert_eq!(format_optional(&Some("Drive".to_string()), "-"), "Drive");
        assert_eq!(format_optional(&Some("  ".to_string()), "-"), "-");
        assert_eq!(format_optional(&None, "none"), "none");
    }

    #[test]
    fn test_format_timestamp() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).single();
        assert_eq!(format_timestamp(dt), "Mar 05, 2024");
        assert_eq!(format_timestamp(None), "-");
    }
}
