//! Outbound header sanitation (spec.md §4.6's Header Filter).

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const BLOCKED_EXACT: &[&str] = &[
    "cookie",
    "authorization",
    "forwarded",
    "x-real-ip",
    "x-matched-path",
];

fn is_blocked(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
        || BLOCKED_EXACT.contains(&lower.as_str())
        || lower.starts_with("x-forwarded-")
        || lower.starts_with("x-vercel-")
        || lower.starts_with("cf-")
}

/// Filters a header set down to what is safe to forward upstream, per the
/// block list in spec.md §4.6.
pub fn filter_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_blocked(name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_forwarding_headers() {
        let headers = vec![
            ("Cookie".to_string(), "s=1".to_string()),
            ("Authorization".to_string(), "Bearer k".to_string()),
            ("X-Vercel-Id".to_string(), "v".to_string()),
            ("X-Forwarded-For".to_string(), "1.2.3.4".to_string()),
            ("CF-Ray".to_string(), "abc".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let filtered = filter_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "Content-Type");
    }

    #[test]
    fn case_insensitive_matching() {
        let headers = vec![("COOKIE".to_string(), "s=1".to_string())];
        assert!(filter_headers(&headers).is_empty());
    }
}
