//! Maps arbitrary backend cell strings onto the small set of lexical
//! forms Prometheus accepts for a sample value.
//!
//! Precedence is significant: the first matching rule wins, so
//! e.g. an empty string is always `"0"` even though it would also
//! fail every later parse attempt anyway.

/// Coerce a raw cell value (as returned by a backend query, already
/// stripped of SQL NULL-ness into `None`) into a Prometheus-legal
/// value string.
pub fn coerce(raw: Option<&str>) -> String {
    let s = match raw {
        None => return "0".to_string(),
        Some(s) => s,
    };

    if s.is_empty() {
        return "0".to_string();
    }

    match s {
        "off" | "f" | "(disabled)" => return "0".to_string(),
        "on" | "t" => return "1".to_string(),
        "NaN" => return "NaN".to_string(),
        _ => {}
    }

    if s.parse::<i64>().is_ok() {
        return s.to_string();
    }
    if s.parse::<f64>().is_ok() {
        return s.to_string();
    }

    "1".to_string()
}
