//! Query orchestration: for each configured custom metric, select
//! the server-appropriate variant, run it against every connected
//! server whose role matches, and merge the results into one
//! registry family per metric, with a `server` label distinguishing
//! series.

use crate::config::{ColumnKind, MetricDef, ServerConfig, ServerRole, SortType};
use crate::pg::{QueryExecutor, QueryError, QueryRow};
use crate::registry::{Labels, MetricKind, Registry};
use std::time::SystemTime;

/// One server's identity as seen by the orchestrator: its
/// configured name (the `server` label value) plus the version/role
/// captured at connect time, needed to pick a variant.
pub struct ServerContext<'a> {
    pub config: &'a ServerConfig,
    pub version: (u32, u32),
    pub role: ServerRole,
}

/// Run every configured custom metric against every server in
/// `servers` whose connection succeeded, merging same-metric results
/// into one family in `registry`. `connections` must be the same
/// length and order as `servers`; a `None` entry means that server's
/// connection failed and it is skipped for this metric (per §4.1's
/// per-server failure semantics).
pub async fn run_custom_metrics<E: QueryExecutor>(
    registry: &mut Registry,
    metrics: &[MetricDef],
    servers: &[ServerContext<'_>],
    connections: &[Option<&E>],
    allowed: impl Fn(&str) -> bool,
    now: SystemTime,
) {
    for metric in metrics {
        if !allowed(&metric.collector_name) {
            continue;
        }
        run_one_metric(registry, metric, servers, connections, now).await;
    }
}

async fn run_one_metric<E: QueryExecutor>(
    registry: &mut Registry,
    metric: &MetricDef,
    servers: &[ServerContext<'_>],
    connections: &[Option<&E>],
    now: SystemTime,
) {
    let mut rows_by_server: Vec<(&ServerContext<'_>, Vec<QueryRow>)> = Vec::new();

    for (ctx, conn) in servers.iter().zip(connections.iter()) {
        if let Some(required) = metric.server_query_type {
            if required != ctx.role {
                continue;
            }
        }
        let Some(conn) = conn else { continue };
        let Some(variant) = metric.variants.select(ctx.version, ctx.role) else {
            continue;
        };
        match conn.execute(&variant.sql).await {
            Ok(rows) => rows_by_server.push((ctx, rows)),
            Err(err) => {
                tracing::warn!(
                    metric = %metric.tag,
                    server = %ctx.config.name,
                    error = %err,
                    "custom metric query failed, skipping"
                );
            }
        }
    }

    if rows_by_server.is_empty() {
        return;
    }

    // Column metadata is identical across servers for one metric
    // (they all select the same variant tree), so borrow it from
    // whichever variant the first successful server picked.
    let first_ctx = rows_by_server[0].0;
    let Some(variant) = metric.variants.select(first_ctx.version, first_ctx.role) else {
        return;
    };
    let is_histogram = variant
        .columns
        .iter()
        .any(|c| c.kind == ColumnKind::Histogram);

    let help = format!("custom metric {}", metric.tag);
    let kind = if is_histogram {
        MetricKind::Histogram
    } else {
        MetricKind::Gauge
    };
    let family = registry.get_or_create(metric.tag.clone(), help, kind);

    let mut emitted: Vec<(Labels, String, SystemTime)> = Vec::new();

    for (ctx, rows) in &rows_by_server {
        for row in rows {
            let mut labels = Labels::new();
            labels.push("server", ctx.config.name.clone());

            let mut label_idx = 0usize;
            let mut first_value: Option<String> = None;
            let mut histogram_bounds: Option<String> = None;
            let mut histogram_counts: Option<String> = None;
            let mut histogram_sum: Option<String> = None;
            let mut histogram_count: Option<String> = None;

            for (i, column) in variant.columns.iter().enumerate() {
                let raw = row.get_text(i);
                match column.kind {
                    ColumnKind::Label => {
                        labels.push(column.name.clone(), raw.unwrap_or_default());
                        label_idx += 1;
                    }
                    ColumnKind::Histogram => {
                        histogram_bounds = raw;
                        let _ = label_idx;
                    }
                    ColumnKind::Gauge | ColumnKind::Counter => {
                        if is_histogram {
                            match column.name.as_str() {
                                n if n.ends_with("_bucket") => histogram_counts = raw,
                                n if n.ends_with("_sum") => histogram_sum = raw,
                                n if n.ends_with("_count") => histogram_count = raw,
                                _ => {}
                            }
                        } else if first_value.is_none() {
                            first_value = raw;
                        }
                    }
                }
            }

            if is_histogram {
                if let (Some(bounds), Some(counts)) = (&histogram_bounds, &histogram_counts) {
                    let series = crate::histogram::assemble(
                        labels,
                        bounds,
                        counts,
                        histogram_sum.as_deref(),
                        histogram_count.as_deref(),
                        now,
                    );
                    family.push_histogram_series(series);
                }
            } else {
                let value = crate::value::coerce(first_value.as_deref());
                emitted.push((labels, value, now));
            }
        }
    }

    if !is_histogram {
        sort_emitted(&mut emitted, metric.sort_type);
        for (labels, value, ts) in emitted {
            family.push_series(labels, vec![crate::registry::Sample::new(value, ts)]);
        }
    }
}

fn sort_emitted(emitted: &mut [(Labels, String, SystemTime)], sort_type: SortType) {
    match sort_type {
        SortType::Insertion => {}
        SortType::TagName => {
            emitted.sort_by(|a, b| {
                let a_name = a.0.iter().next().map(|(_, v)| v.clone()).unwrap_or_default();
                let b_name = b.0.iter().next().map(|(_, v)| v.clone()).unwrap_or_default();
                a_name.cmp(&b_name)
            });
        }
        SortType::FirstColumn => {
            emitted.sort_by(|a, b| a.1.cmp(&b.1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnDef, ColumnKind, QueryVariant, VariantTree};
    use crate::pg::FakeExecutor;
    use crate::registry::FamilyValue;
    use std::sync::atomic::AtomicBool;

    fn server(name: &str, role: ServerRole) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            dbname: "postgres".to_string(),
            role,
            data_directory: None,
            wal_directory: None,
            extension: AtomicBool::new(true),
            installed_extensions: Vec::new(),
        }
    }

    fn metric(tag: &str, columns: Vec<ColumnDef>) -> MetricDef {
        MetricDef {
            tag: tag.to_string(),
            collector_name: tag.to_string(),
            sort_type: SortType::Insertion,
            server_query_type: None,
            variants: VariantTree {
                variants: vec![QueryVariant {
                    min_version: None,
                    max_version: None,
                    role: None,
                    sql: format!("select {tag}"),
                    columns,
                }],
            },
        }
    }

    #[tokio::test]
    async fn merges_one_gauge_metric_across_servers() {
        let metrics = vec![metric(
            "pg_connections",
            vec![ColumnDef { name: "count".to_string(), kind: ColumnKind::Gauge }],
        )];
        let s1 = server("s1", ServerRole::Primary);
        let s2 = server("s2", ServerRole::Primary);
        let servers = vec![
            ServerContext { config: &s1, version: (15, 4), role: ServerRole::Primary },
            ServerContext { config: &s2, version: (15, 4), role: ServerRole::Primary },
        ];
        let e1 = FakeExecutor::new(vec![Ok(vec![FakeExecutor::row(&[Some("10")])])]);
        let e2 = FakeExecutor::new(vec![Ok(vec![FakeExecutor::row(&[Some("20")])])]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&e1), Some(&e2)];

        let mut registry = Registry::new();
        run_custom_metrics(&mut registry, &metrics, &servers, &connections, |_| true, SystemTime::now()).await;

        assert_eq!(registry.len(), 1);
        let family = registry.iter().next().unwrap();
        assert_eq!(family.name, "pg_connections");
        let FamilyValue::Plain(series) = &family.value else {
            panic!("expected plain family")
        };
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].samples[0].value, "10");
        assert_eq!(series[1].samples[0].value, "20");
    }

    #[tokio::test]
    async fn disallowed_collector_is_skipped() {
        let metrics = vec![metric(
            "pg_blocked",
            vec![ColumnDef { name: "count".to_string(), kind: ColumnKind::Gauge }],
        )];
        let s1 = server("s1", ServerRole::Primary);
        let servers = vec![ServerContext { config: &s1, version: (15, 4), role: ServerRole::Primary }];
        let e1 = FakeExecutor::new(vec![Ok(vec![FakeExecutor::row(&[Some("1")])])]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&e1)];

        let mut registry = Registry::new();
        run_custom_metrics(&mut registry, &metrics, &servers, &connections, |_| false, SystemTime::now()).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn role_mismatch_skips_server() {
        let metrics = vec![metric(
            "pg_replica_only",
            vec![ColumnDef { name: "count".to_string(), kind: ColumnKind::Gauge }],
        )];
        let mut m = metrics;
        m[0].server_query_type = Some(ServerRole::Replica);
        let s1 = server("s1", ServerRole::Primary);
        let servers = vec![ServerContext { config: &s1, version: (15, 4), role: ServerRole::Primary }];
        let e1 = FakeExecutor::new(vec![Ok(vec![FakeExecutor::row(&[Some("1")])])]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&e1)];

        let mut registry = Registry::new();
        run_custom_metrics(&mut registry, &m, &servers, &connections, |_| true, SystemTime::now()).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn histogram_columns_assemble_a_histogram_family() {
        let columns = vec![
            ColumnDef { name: "bounds".to_string(), kind: ColumnKind::Histogram },
            ColumnDef { name: "x_bucket".to_string(), kind: ColumnKind::Counter },
            ColumnDef { name: "x_sum".to_string(), kind: ColumnKind::Counter },
            ColumnDef { name: "x_count".to_string(), kind: ColumnKind::Counter },
        ];
        let metrics = vec![metric("x", columns)];
        let s1 = server("s1", ServerRole::Primary);
        let servers = vec![ServerContext { config: &s1, version: (15, 4), role: ServerRole::Primary }];
        let row = FakeExecutor::row(&[Some("{0.1,0.5,1}"), Some("{2,5,7}"), Some("3.14"), Some("9")]);
        let e1 = FakeExecutor::new(vec![Ok(vec![row])]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&e1)];

        let mut registry = Registry::new();
        run_custom_metrics(&mut registry, &metrics, &servers, &connections, |_| true, SystemTime::now()).await;

        let family = registry.iter().next().unwrap();
        let FamilyValue::Histogram(series) = &family.value else {
            panic!("expected histogram family")
        };
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].buckets.len(), 3);
        assert_eq!(series[0].sum, "3.14");
        assert_eq!(series[0].count, "9");
    }

    #[tokio::test]
    async fn query_error_skips_server_without_failing_scrape() {
        let metrics = vec![metric(
            "pg_flaky",
            vec![ColumnDef { name: "count".to_string(), kind: ColumnKind::Gauge }],
        )];
        let s1 = server("s1", ServerRole::Primary);
        let s2 = server("s2", ServerRole::Primary);
        let servers = vec![
            ServerContext { config: &s1, version: (15, 4), role: ServerRole::Primary },
            ServerContext { config: &s2, version: (15, 4), role: ServerRole::Primary },
        ];
        let e1 = FakeExecutor::new(vec![Err("connection reset".to_string())]);
        let e2 = FakeExecutor::new(vec![Ok(vec![FakeExecutor::row(&[Some("7")])])]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&e1), Some(&e2)];

        let mut registry = Registry::new();
        run_custom_metrics(&mut registry, &metrics, &servers, &connections, |_| true, SystemTime::now()).await;

        let family = registry.iter().next().unwrap();
        let FamilyValue::Plain(series) = &family.value else {
            panic!("expected plain family")
        };
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].samples[0].value, "7");
    }
}
