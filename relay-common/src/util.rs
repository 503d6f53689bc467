//! Small string helpers.

use regex::Regex;
use std::sync::OnceLock;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Cuts on character boundaries, so multi-byte text is safe.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

fn secret_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let raw: &[(&str, &str)] = &[
            (r"(?i)(/renew)\s+\S+", "$1 ***REDACTED***"),
            (r"(?i)(token|secret|session|bearer)\s*[=:]\s*\S{10,}", "$1=***REDACTED***"),
            (r"\d{6,}:[A-Za-z0-9_-]{30,}", "***REDACTED_BOT_TOKEN***"),
            (r"eyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_.-]+", "***REDACTED_JWT***"),
        ];
        raw.iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|re| (re, *replacement))
            })
            .collect()
    })
}

/// Sanitize a string for safe logging (redact tokens and credentials).
pub fn sanitize_for_log(s: &str) -> String {
    let mut result = s.to_string();
    for (re, replacement) in secret_patterns() {
        result = re.replace_all(&result, *replacement).to_string();
    }
    result
}
