//! Timestamp parsing for platform-supplied time strings.
//!
//! The platform is not consistent about offsets: conversation watermarks
//! arrive as `2024-01-15T10:30:00+0000`, other surfaces use strict RFC 3339
//! (`+00:00` or `Z`). Everything funnels through one parser returning an
//! explicit `Option`, so callers choose their own fallback policy instead
//! of inheriting a silent one.

use chrono::{DateTime, Utc};

/// Parse a platform timestamp. Accepts RFC 3339 and the compact `+0000`
/// offset form. Returns `None` on anything else.
pub fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_graph_time("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(dt.timestamp(), 1705314600);

        let dt = parse_graph_time("2024-01-15T10:30:00+00:00").unwrap();
        assert_eq!(dt.timestamp(), 1705314600);
    }

    #[test]
    fn test_parse_compact_offset() {
        let dt = parse_graph_time("2024-01-15T10:30:00+0000").unwrap();
        assert_eq!(dt.timestamp(), 1705314600);

        // Non-UTC offsets normalize to UTC.
        let dt = parse_graph_time("2024-01-15T18:30:00+0800").unwrap();
        assert_eq!(dt.timestamp(), 1705314600);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_graph_time("").is_none());
        assert!(parse_graph_time("yesterday").is_none());
        assert!(parse_graph_time("2024-01-15").is_none());
    }
}
