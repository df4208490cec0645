//! Renders a [`Registry`](crate::registry::Registry) to the
//! Prometheus text exposition format.
//!
//! Serialization is chunked one unit at a time (one plain family, or
//! one of a histogram's three derived blocks) so the scrape
//! coordinator can stream each chunk to the client and append it to
//! the cache buffer in lockstep, matching the teacher's
//! `render_scrape_data` "one rendered unit at a time" shape.

use crate::registry::{FamilyValue, MetricFamily, Registry};
use std::fmt::Write as _;

/// Render the whole registry into an ordered sequence of text
/// chunks. Concatenating every chunk (in order) yields the complete
/// exposition document.
pub fn render_chunks(registry: &Registry) -> Vec<String> {
    registry.iter().flat_map(render_family).collect()
}

fn render_family(family: &MetricFamily) -> Vec<String> {
    match &family.value {
        FamilyValue::Plain(series) => vec![render_plain_family(family, series)],
        FamilyValue::Histogram(series) => render_histogram_family(family, series),
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn render_plain_family(family: &MetricFamily, series: &[crate::registry::Series]) -> String {
    let mut out = String::new();
    write_header(&mut out, &family.name, &family.help, family.kind.as_str());
    for s in series {
        for sample in &s.samples {
            write_sample_line(&mut out, &family.name, &s.labels, None, sample);
        }
    }
    out.push('\n');
    out
}

fn render_histogram_family(
    family: &MetricFamily,
    series: &[crate::registry::HistogramSeries],
) -> Vec<String> {
    let bucket_name = format!("{}_bucket", family.name);
    let sum_name = format!("{}_sum", family.name);
    let count_name = format!("{}_count", family.name);

    let mut bucket_block = String::new();
    write_header(&mut bucket_block, &bucket_name, &family.help, "histogram");
    for s in series {
        for (bound, cumulative) in &s.buckets {
            let sample = crate::registry::Sample::new(cumulative.clone(), s.timestamp);
            write_sample_line(&mut bucket_block, &bucket_name, &s.labels, Some(("le", bound.as_str())), &sample);
        }
        let inf_sample = crate::registry::Sample::new(s.count.clone(), s.timestamp);
        write_sample_line(&mut bucket_block, &bucket_name, &s.labels, Some(("le", "+Inf")), &inf_sample);
    }
    bucket_block.push('\n');

    let mut sum_block = String::new();
    write_header(&mut sum_block, &sum_name, &family.help, "histogram");
    for s in series {
        let sample = crate::registry::Sample::new(s.sum.clone(), s.timestamp);
        write_sample_line(&mut sum_block, &sum_name, &s.labels, None, &sample);
    }
    sum_block.push('\n');

    let mut count_block = String::new();
    write_header(&mut count_block, &count_name, &family.help, "histogram");
    for s in series {
        let sample = crate::registry::Sample::new(s.count.clone(), s.timestamp);
        write_sample_line(&mut count_block, &count_name, &s.labels, None, &sample);
    }
    count_block.push('\n');

    vec![bucket_block, sum_block, count_block]
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, escape_help(help));
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn write_sample_line(
    out: &mut String,
    name: &str,
    labels: &crate::registry::Labels,
    extra: Option<(&str, &str)>,
    sample: &crate::registry::Sample,
) {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, crate::label::escape_value(Some(v))))
        .collect();
    // `extra` carries the histogram `le` bucket bound, a numeric
    // literal (or "+Inf") that must not be dot-folded the way a
    // regular label value is (§8#3).
    if let Some((k, v)) = extra {
        pairs.push(format!("{}=\"{}\"", k, crate::label::escape_bucket_bound(v)));
    }
    if pairs.is_empty() {
        let _ = writeln!(out, "{} {} {}", name, sample.value, sample.timestamp_millis());
    } else {
        let _ = writeln!(
            out,
            "{}{{{}}} {} {}",
            name,
            pairs.join(","),
            sample.value,
            sample.timestamp_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HistogramSeries, Labels, MetricKind, Registry, Sample};
    use std::time::SystemTime;

    #[test]
    fn empty_registry_renders_no_chunks() {
        let registry = Registry::new();
        assert!(render_chunks(&registry).is_empty());
    }

    #[test]
    fn gauge_family_has_help_type_and_sample_line() {
        let mut registry = Registry::new();
        let family = registry.get_or_create("pgexporter_state", "always 1", MetricKind::Gauge);
        family.push_series(Labels::new(), vec![Sample::new("1", SystemTime::now())]);
        let chunks = render_chunks(&registry);
        assert_eq!(chunks.len(), 1);
        let text = &chunks[0];
        assert!(text.contains("# HELP pgexporter_state always 1\n"));
        assert!(text.contains("# TYPE pgexporter_state gauge\n"));
        assert!(text.contains("pgexporter_state 1 "));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn labeled_series_renders_sorted_insertion_order_labels() {
        let mut registry = Registry::new();
        let family = registry.get_or_create(
            "pgexporter_postgresql_active",
            "connection state",
            MetricKind::Gauge,
        );
        let mut labels = Labels::new();
        labels.push("server", "s1");
        family.push_series(labels, vec![Sample::new("1", SystemTime::now())]);
        let chunks = render_chunks(&registry);
        assert!(chunks[0].contains("pgexporter_postgresql_active{server=\"s1\"} 1 "));
    }

    #[test]
    fn histogram_emits_bucket_sum_count_in_order() {
        let mut registry = Registry::new();
        let family = registry.get_or_create("req_latency", "latency", MetricKind::Histogram);
        let mut labels = Labels::new();
        labels.push("server", "s1");
        family.push_histogram_series(HistogramSeries {
            labels,
            buckets: vec![
                ("0.1".to_string(), "2".to_string()),
                ("0.5".to_string(), "5".to_string()),
                ("1".to_string(), "7".to_string()),
            ],
            sum: "3.14".to_string(),
            count: "9".to_string(),
            timestamp: SystemTime::now(),
        });
        let chunks = render_chunks(&registry);
        assert_eq!(chunks.len(), 3);

        let bucket_text = &chunks[0];
        assert!(bucket_text.contains("req_latency_bucket{server=\"s1\",le=\"0.1\"} 2 "));
        assert!(bucket_text.contains("req_latency_bucket{server=\"s1\",le=\"0.5\"} 5 "));
        assert!(bucket_text.contains("req_latency_bucket{server=\"s1\",le=\"1\"} 7 "));
        assert!(bucket_text.contains("req_latency_bucket{server=\"s1\",le=\"+Inf\"} 9 "));

        assert!(chunks[1].contains("req_latency_sum{server=\"s1\"} 3.14 "));
        assert!(chunks[2].contains("req_latency_count{server=\"s1\"} 9 "));
    }

    #[test]
    fn serialization_is_stable_across_runs() {
        let mut registry = Registry::new();
        let family = registry.get_or_create("m", "h", MetricKind::Counter);
        let ts = SystemTime::now();
        family.push_series(Labels::new(), vec![Sample::new("1", ts)]);
        let first = render_chunks(&registry);
        let second = render_chunks(&registry);
        assert_eq!(first, second);
    }
}
