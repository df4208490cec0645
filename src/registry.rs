//! The in-memory metric model: families, series, samples, and the
//! registry that owns them.
//!
//! Iteration is always name-sorted (`BTreeMap`) so that two scrapes
//! over the same data serialize to byte-identical text.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A metric's kind, used both for the registry's dispatch and for
/// the `# TYPE` line in the exposition format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A single sample: a pre-formatted value string plus the wall-clock
/// timestamp it was taken at.
#[derive(Debug, Clone)]
pub struct Sample {
    pub value: String,
    pub timestamp: SystemTime,
}

impl Sample {
    pub fn new(value: impl Into<String>, timestamp: SystemTime) -> Self {
        Sample {
            value: value.into(),
            timestamp,
        }
    }

    /// Milliseconds since the epoch, as the exposition format wants it.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// An ordered label set. Enforces name uniqueness on insertion;
/// preserves insertion order otherwise, per §3's invariants.
#[derive(Debug, Clone, Default)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new() -> Self {
        Labels(Vec::new())
    }

    /// Appends a label, sanitizing the name per §4.3. Panics if the
    /// (sanitized) name is already present — that would violate the
    /// label-name-uniqueness invariant and indicates a collector bug,
    /// not a runtime condition callers should expect to recover from.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = crate::label::sanitize_name(&name.into());
        assert!(
            !self.0.iter().any(|(n, _)| n == &name),
            "duplicate label name {name:?} in series"
        );
        self.0.push((name, value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

/// One labelset's worth of samples under a family.
#[derive(Debug, Clone)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// One histogram observation: bucket bounds/cumulative-counts pairs
/// plus `_sum`/`_count`, all under one label set.
#[derive(Debug, Clone)]
pub struct HistogramSeries {
    pub labels: Labels,
    /// `(bound, cumulative_count)` pairs in ascending-bound order.
    /// The `+Inf` bucket is synthesized at serialization time, not
    /// stored here.
    pub buckets: Vec<(String, String)>,
    pub sum: String,
    pub count: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub enum FamilyValue {
    Plain(Vec<Series>),
    Histogram(Vec<HistogramSeries>),
}

/// A metric family: identity (name, help, kind) plus its series.
#[derive(Debug, Clone)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub value: FamilyValue,
}

impl MetricFamily {
    fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        let value = match kind {
            MetricKind::Histogram => FamilyValue::Histogram(Vec::new()),
            _ => FamilyValue::Plain(Vec::new()),
        };
        MetricFamily {
            name: name.into(),
            help: help.into(),
            kind,
            value,
        }
    }

    pub fn push_series(&mut self, labels: Labels, samples: Vec<Sample>) {
        match &mut self.value {
            FamilyValue::Plain(series) => series.push(Series { labels, samples }),
            FamilyValue::Histogram(_) => {
                panic!("push_series called on histogram family {:?}", self.name)
            }
        }
    }

    pub fn push_histogram_series(&mut self, series: HistogramSeries) {
        match &mut self.value {
            FamilyValue::Histogram(all) => all.push(series),
            FamilyValue::Plain(_) => {
                panic!("push_histogram_series called on non-histogram family {:?}", self.name)
            }
        }
    }
}

/// Owning container of metric families, keyed by name. Insertion is
/// idempotent: a second `get_or_create` with the same name returns
/// the existing family rather than overwriting it, so collectors can
/// append further series to a family another collector started.
#[derive(Debug, Default)]
pub struct Registry {
    families: BTreeMap<String, MetricFamily>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn get_or_create(
        &mut self,
        name: impl Into<String>,
        help: impl Into<String>,
        kind: MetricKind,
    ) -> &mut MetricFamily {
        let name = name.into();
        self.families
            .entry(name.clone())
            .or_insert_with(|| MetricFamily::new(name, help, kind))
    }

    /// Ordered-by-name iteration, as required for deterministic
    /// serialization.
    pub fn iter(&self) -> impl Iterator<Item = &MetricFamily> {
        self.families.values()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn get_or_create_is_idempotent() {
        let mut registry = Registry::new();
        registry.get_or_create("pgexporter_state", "always 1", MetricKind::Gauge);
        registry.get_or_create("pgexporter_state", "always 1", MetricKind::Gauge);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_names_yield_distinct_families() {
        let mut registry = Registry::new();
        registry.get_or_create("a", "", MetricKind::Gauge);
        registry.get_or_create("b", "", MetricKind::Counter);
        registry.get_or_create("a", "", MetricKind::Gauge);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn iteration_is_name_sorted() {
        let mut registry = Registry::new();
        registry.get_or_create("zzz", "", MetricKind::Gauge);
        registry.get_or_create("aaa", "", MetricKind::Gauge);
        registry.get_or_create("mmm", "", MetricKind::Gauge);
        let names: Vec<&str> = registry.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "mmm", "zzz"]);
    }

    #[test]
    #[should_panic(expected = "duplicate label name")]
    fn duplicate_label_names_panic() {
        let mut labels = Labels::new();
        labels.push("server", "s1");
        labels.push("server", "s2");
    }

    #[test]
    fn append_series_preserves_insertion_order() {
        let mut registry = Registry::new();
        let family = registry.get_or_create("m", "", MetricKind::Gauge);
        let mut l1 = Labels::new();
        l1.push("server", "s1");
        family.push_series(l1, vec![Sample::new("1", SystemTime::now())]);
        let mut l2 = Labels::new();
        l2.push("server", "s2");
        family.push_series(l2, vec![Sample::new("0", SystemTime::now())]);

        let FamilyValue::Plain(series) = &family.value else {
            panic!("expected plain family")
        };
        let servers: Vec<&str> = series
            .iter()
            .map(|s| s.labels.iter().next().unwrap().1.as_str())
            .collect();
        assert_eq!(servers, vec!["s1", "s2"]);
    }
}
