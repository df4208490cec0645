//! Built-in collectors: the fixed inventory of metrics the exporter
//! always produces, independent of any operator-configured custom
//! metric. Run in a fixed order every scrape (§4.7) so serialization
//! stays deterministic scrape over scrape.

use crate::config::ServerConfig;
use crate::logging::LoggingCounters;
use crate::pg::QueryExecutor;
use crate::registry::{Labels, MetricKind, Registry, Sample};
use std::sync::atomic::Ordering;
use std::time::SystemTime;

const PGEXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `pgexporter_state 1` — a constant presence signal, always the
/// first family emitted.
pub fn collect_state(registry: &mut Registry, now: SystemTime) {
    let family = registry.get_or_create(
        "pgexporter_state",
        "whether the exporter process is running",
        MetricKind::Gauge,
    );
    family.push_series(Labels::new(), vec![Sample::new("1", now)]);
}

/// The four `pgexporter_logging_*` counters, read live off the
/// shared [`LoggingCounters`].
pub fn collect_logging(registry: &mut Registry, counters: &LoggingCounters, now: SystemTime) {
    let info = registry.get_or_create(
        "pgexporter_logging_info",
        "number of info messages logged",
        MetricKind::Gauge,
    );
    info.push_series(Labels::new(), vec![Sample::new(counters.info().to_string(), now)]);

    let warn = registry.get_or_create(
        "pgexporter_logging_warn",
        "number of warning messages logged",
        MetricKind::Gauge,
    );
    warn.push_series(Labels::new(), vec![Sample::new(counters.warn().to_string(), now)]);

    let error = registry.get_or_create(
        "pgexporter_logging_error",
        "number of error messages logged",
        MetricKind::Gauge,
    );
    error.push_series(Labels::new(), vec![Sample::new(counters.error().to_string(), now)]);

    let fatal = registry.get_or_create(
        "pgexporter_logging_fatal",
        "number of fatal messages logged",
        MetricKind::Gauge,
    );
    fatal.push_series(Labels::new(), vec![Sample::new(counters.fatal().to_string(), now)]);
}

/// `pgexporter_version{pgexporter_version="x.y.z"} 1`.
pub fn collect_version(registry: &mut Registry, now: SystemTime) {
    let family = registry.get_or_create(
        "pgexporter_version",
        "the exporter's own version",
        MetricKind::Counter,
    );
    let mut labels = Labels::new();
    labels.push("pgexporter_version", PGEXPORTER_VERSION);
    family.push_series(labels, vec![Sample::new("1", now)]);
}

/// One connected server's worth of per-server builtin metrics:
/// active/version/primary/uptime, plus (when the connection
/// succeeded) settings and extension info. Settings are returned
/// separately so the caller can fold them across servers into one
/// family per distinct setting name, per §4.7.
pub struct ServerCollectorInputs<'a> {
    pub config: &'a ServerConfig,
    pub connection: Option<&'a (dyn QueryExecutor + Sync)>,
    pub version: Option<(u32, u32)>,
    pub is_primary: Option<bool>,
    pub uptime_seconds: Option<String>,
}

pub fn collect_server_active(registry: &mut Registry, input: &ServerCollectorInputs<'_>, now: SystemTime) {
    let family = registry.get_or_create(
        "pgexporter_postgresql_active",
        "whether the exporter has a live connection to this server",
        MetricKind::Gauge,
    );
    let mut labels = Labels::new();
    labels.push("server", input.config.name.clone());
    let value = if input.connection.is_some() { "1" } else { "0" };
    family.push_series(labels, vec![Sample::new(value, now)]);
}

pub fn collect_server_version(registry: &mut Registry, input: &ServerCollectorInputs<'_>, now: SystemTime) {
    let Some((major, minor)) = input.version else {
        return;
    };
    let family = registry.get_or_create(
        "pgexporter_postgresql_version",
        "the server's reported major/minor version",
        MetricKind::Gauge,
    );
    let mut labels = Labels::new();
    labels.push("server", input.config.name.clone());
    labels.push("version", major.to_string());
    labels.push("minor_version", minor.to_string());
    family.push_series(labels, vec![Sample::new("1", now)]);
}

pub fn collect_server_primary(registry: &mut Registry, input: &ServerCollectorInputs<'_>, now: SystemTime) {
    let Some(is_primary) = input.is_primary else {
        return;
    };
    let family = registry.get_or_create(
        "pgexporter_postgresql_primary",
        "whether this server is a primary (1) or replica (0)",
        MetricKind::Gauge,
    );
    let mut labels = Labels::new();
    labels.push("server", input.config.name.clone());
    family.push_series(labels, vec![Sample::new(if is_primary { "1" } else { "0" }, now)]);
}

pub fn collect_server_uptime(registry: &mut Registry, input: &ServerCollectorInputs<'_>, now: SystemTime) {
    let Some(raw) = &input.uptime_seconds else {
        return;
    };
    let family = registry.get_or_create(
        "pgexporter_postgresql_uptime",
        "seconds since the server started",
        MetricKind::Counter,
    );
    let mut labels = Labels::new();
    labels.push("server", input.config.name.clone());
    family.push_series(labels, vec![Sample::new(crate::value::coerce(Some(raw)), now)]);
}

/// One `pg_settings` row: name plus its coerced value for one
/// server. Collected per server, then folded across servers into
/// one family per distinct setting name by [`collect_settings`].
pub struct SettingRow {
    pub server: String,
    pub name: String,
    pub raw_value: Option<String>,
}

/// Restored from `original_source/prometheus.c`'s settings loop: one
/// `pgexporter_<setting>` gauge family per distinct setting name
/// seen across all servers, each carrying a `server` label.
pub fn collect_settings(registry: &mut Registry, rows: &[SettingRow], now: SystemTime) {
    for row in rows {
        let metric_name = format!("pgexporter_{}", crate::label::sanitize_name(&row.name));
        let family = registry.get_or_create(
            metric_name,
            format!("postgresql setting {}", row.name),
            MetricKind::Gauge,
        );
        let mut labels = Labels::new();
        labels.push("server", row.server.clone());
        family.push_series(
            labels,
            vec![Sample::new(crate::value::coerce(row.raw_value.as_deref()), now)],
        );
    }
}

/// One installed extension, as reported by the server.
pub struct ExtensionRow {
    pub server: String,
    pub extension: String,
    pub version: String,
    pub comment: String,
}

pub fn collect_extension_info(registry: &mut Registry, rows: &[ExtensionRow], now: SystemTime) {
    let family = registry.get_or_create(
        "pgexporter_postgresql_extension_info",
        "installed PostgreSQL extensions",
        MetricKind::Gauge,
    );
    for row in rows {
        let mut labels = Labels::new();
        labels.push("server", row.server.clone());
        labels.push("extension", row.extension.clone());
        labels.push("version", row.version.clone());
        labels.push("comment", row.comment.clone());
        family.push_series(labels, vec![Sample::new("1", now)]);
    }
}

/// Which argument(s) (if any) an extension's support function
/// expects. Restored from `original_source`'s three dispatch modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionInput {
    None,
    DataDirectory,
    WalDirectory,
}

impl ExtensionInput {
    fn metric_suffix(self) -> &'static str {
        match self {
            ExtensionInput::None => "",
            ExtensionInput::DataDirectory => "_data",
            ExtensionInput::WalDirectory => "_wal",
        }
    }

    fn sql_argument<'a>(self, server: &'a ServerConfig) -> Option<&'a str> {
        match self {
            ExtensionInput::None => None,
            ExtensionInput::DataDirectory => server.data_directory.as_deref(),
            ExtensionInput::WalDirectory => server.wal_directory.as_deref(),
        }
    }
}

/// One extension support function to probe, and the mode to invoke
/// it in.
pub struct ExtensionFunction {
    pub name: String,
    pub input: ExtensionInput,
}

/// Ask the installed support extension which functions it offers, via
/// its own `pgexporter_get_functions()` catalog function, and turn
/// each row into an [`ExtensionFunction`] to probe. Restored from
/// `original_source`'s `extension_information`: a function flagged
/// as taking input is dispatched in both `data_directory` and
/// `wal_directory` modes (skipping the discovery function itself,
/// `pgexporter_is_supported`); one with no input is dispatched once
/// (skipping `pgexporter_get_functions`).
pub async fn discover_extension_functions<E: QueryExecutor>(
    connection: &E,
) -> Result<Vec<ExtensionFunction>, crate::pg::QueryError> {
    let rows = connection
        .execute("SELECT function_name, has_input FROM pgexporter_get_functions()")
        .await?;

    let mut functions = Vec::new();
    for row in &rows {
        let Some(name) = row.get_text(0) else { continue };
        let has_input = matches!(row.get_text(1).as_deref(), Some("t") | Some("true"));

        if has_input {
            if name == "pgexporter_is_supported" {
                continue;
            }
            functions.push(ExtensionFunction { name: name.clone(), input: ExtensionInput::DataDirectory });
            functions.push(ExtensionFunction { name, input: ExtensionInput::WalDirectory });
        } else {
            if name == "pgexporter_get_functions" {
                continue;
            }
            functions.push(ExtensionFunction { name, input: ExtensionInput::None });
        }
    }
    Ok(functions)
}

/// Invoke every configured extension function against `connection`,
/// coercing each single-cell result into its own gauge. A function
/// that errors (not installed, wrong signature, etc.) is skipped
/// without failing the scrape, bumping the warn counter.
pub async fn collect_extension_functions<E: QueryExecutor>(
    registry: &mut Registry,
    server: &ServerConfig,
    connection: &E,
    functions: &[ExtensionFunction],
    now: SystemTime,
) {
    for function in functions {
        let sql = match function.input.sql_argument(server) {
            Some(arg) => format!("SELECT {}('{}')", function.name, arg.replace('\'', "''")),
            None if function.input == ExtensionInput::None => {
                format!("SELECT {}()", function.name)
            }
            None => continue, // directory not configured for this mode
        };

        match connection.execute(&sql).await {
            Ok(rows) => {
                let Some(row) = rows.into_iter().next() else {
                    continue;
                };
                if row.is_empty() {
                    continue;
                }
                let raw = row.get_text(0);
                let metric_name =
                    format!("pgexporter_postgresql_ext_{}{}", function.name, function.input.metric_suffix());
                let family = registry.get_or_create(
                    metric_name,
                    format!("extension function {}", function.name),
                    MetricKind::Gauge,
                );
                let mut labels = Labels::new();
                labels.push("server", server.name.clone());
                family.push_series(labels, vec![Sample::new(crate::value::coerce(raw.as_deref()), now)]);
            }
            Err(err) => {
                tracing::warn!(
                    server = %server.name,
                    function = %function.name,
                    error = %err,
                    "extension function probe failed, skipping"
                );
                server.extension.store(false, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FamilyValue;

    #[test]
    fn state_is_always_one() {
        let mut registry = Registry::new();
        collect_state(&mut registry, SystemTime::now());
        let family = registry.iter().next().unwrap();
        let FamilyValue::Plain(series) = &family.value else {
            panic!("expected plain family")
        };
        assert_eq!(series[0].samples[0].value, "1");
    }

    #[test]
    fn logging_counters_reflect_live_values() {
        let counters = LoggingCounters::default();
        counters.bump_fatal();
        let mut registry = Registry::new();
        collect_logging(&mut registry, &counters, SystemTime::now());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn settings_collapse_by_name_across_servers() {
        let rows = vec![
            SettingRow {
                server: "s1".to_string(),
                name: "max_connections".to_string(),
                raw_value: Some("100".to_string()),
            },
            SettingRow {
                server: "s2".to_string(),
                name: "max_connections".to_string(),
                raw_value: Some("200".to_string()),
            },
        ];
        let mut registry = Registry::new();
        collect_settings(&mut registry, &rows, SystemTime::now());
        assert_eq!(registry.len(), 1);
        let family = registry.iter().next().unwrap();
        assert_eq!(family.name, "pgexporter_max_connections");
        let FamilyValue::Plain(series) = &family.value else {
            panic!("expected plain family")
        };
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn extension_input_picks_suffix_and_argument() {
        assert_eq!(ExtensionInput::None.metric_suffix(), "");
        assert_eq!(ExtensionInput::DataDirectory.metric_suffix(), "_data");
        assert_eq!(ExtensionInput::WalDirectory.metric_suffix(), "_wal");
    }

    #[tokio::test]
    async fn discover_dispatches_has_input_functions_twice_and_skips_discovery_functions() {
        let fake = crate::pg::FakeExecutor::new(vec![Ok(vec![
            crate::pg::FakeExecutor::row(&[Some("pgexporter_is_supported"), Some("t")]),
            crate::pg::FakeExecutor::row(&[Some("pgexporter_get_functions"), Some("f")]),
            crate::pg::FakeExecutor::row(&[Some("pgexporter_wal_size"), Some("t")]),
            crate::pg::FakeExecutor::row(&[Some("pgexporter_cluster_size"), Some("f")]),
        ])]);

        let functions = discover_extension_functions(&fake).await.unwrap();

        let names_and_inputs: Vec<(&str, ExtensionInput)> =
            functions.iter().map(|f| (f.name.as_str(), f.input)).collect();
        assert_eq!(
            names_and_inputs,
            vec![
                ("pgexporter_wal_size", ExtensionInput::DataDirectory),
                ("pgexporter_wal_size", ExtensionInput::WalDirectory),
                ("pgexporter_cluster_size", ExtensionInput::None),
            ]
        );
    }

    #[tokio::test]
    async fn discover_propagates_query_errors() {
        let fake = crate::pg::FakeExecutor::new(vec![Err("catalog function missing".to_string())]);
        assert!(discover_extension_functions(&fake).await.is_err());
    }
}
