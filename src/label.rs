//! Label-safe encoding: escaping label *values* and folding illegal
//! characters out of label *names*.

/// Escape a raw string so it is safe to embed as a Prometheus label
/// value inside `"..."`. Rules, applied per character, in order:
/// `"` -> `\"`, `\` -> `\\`, `.` -> `_` except a trailing `.` which
/// is dropped outright.
///
/// Empty / absent input maps to the empty string.
pub fn escape_value(raw: Option<&str>) -> String {
    let s = match raw {
        None => return String::new(),
        Some(s) if s.is_empty() => return String::new(),
        Some(s) => s,
    };
    fold_dots(escape_quotes_and_backslashes(s))
}

/// Label names may never contain `.` (not a legal character in a
/// Prometheus label name); apply the same trailing-dot-drop /
/// dot-to-underscore rule used for values, with no quote escaping
/// (names never need it).
pub fn sanitize_name(raw: &str) -> String {
    fold_dots(raw.to_string())
}

/// Escape a raw string for embedding as a label value *without*
/// folding dots, for the one label value whose literal form a
/// consuming dashboard depends on: a histogram bucket's `le` bound
/// (e.g. `0.1`), which must round-trip as a number rather than as a
/// sanitized identifier (§8#3).
pub fn escape_bucket_bound(raw: &str) -> String {
    escape_quotes_and_backslashes(raw)
}

fn escape_quotes_and_backslashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn fold_dots(s: String) -> String {
    let trimmed = s.strip_suffix('.').unwrap_or(&s);
    trimmed.replace('.', "_")
}
