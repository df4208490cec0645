//! Parses PostgreSQL array literals for histogram bucket bounds and
//! cumulative counts, and assembles a [`HistogramSeries`].

use crate::registry::HistogramSeries;
use std::time::SystemTime;
use tracing::trace;

/// Parse a PostgreSQL array literal of the form `{v1,v2,...,vn}`
/// into its element strings. Returns an empty vector for `{}` or an
/// unparsable literal (no surrounding braces).
pub fn parse_pg_array(literal: &str) -> Vec<String> {
    let trimmed = literal.trim();
    if trimmed.len() < 2 || !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return Vec::new();
    }
    let inner = &trimmed[1..trimmed.len() - 1];
    if inner.is_empty() {
        return Vec::new();
    }
    inner.split(',').map(|s| s.trim().to_string()).collect()
}

/// Assemble one histogram series from its raw query-row inputs.
/// `bounds` and `counts` are the raw (unparsed) PostgreSQL array
/// literals; `sum`/`count` are plain scalar cells. Lengths of
/// `bounds`/`counts` must match; on mismatch, only the leading pairs
/// the shorter array allows are kept and a trace diagnostic is
/// logged, per §4.6.
pub fn assemble(
    labels: crate::registry::Labels,
    bounds_literal: &str,
    counts_literal: &str,
    sum_raw: Option<&str>,
    count_raw: Option<&str>,
    timestamp: SystemTime,
) -> HistogramSeries {
    let bounds = parse_pg_array(bounds_literal);
    let counts = parse_pg_array(counts_literal);

    if bounds.len() != counts.len() {
        trace!(
            bounds_len = bounds.len(),
            counts_len = counts.len(),
            "histogram bucket array length mismatch; truncating to the shorter array"
        );
    }

    let n = bounds.len().min(counts.len());
    let buckets: Vec<(String, String)> = bounds
        .into_iter()
        .take(n)
        .zip(counts.into_iter().take(n))
        .collect();

    HistogramSeries {
        labels,
        buckets,
        sum: crate::value::coerce(sum_raw),
        count: crate::value::coerce(count_raw),
        timestamp,
    }
}
