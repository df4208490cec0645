//! The scrape coordinator: ties the query orchestrator, built-in
//! collectors, formatter, and cache together into one `/metrics`
//! response, per §4.1.
//!
//! The original, forked-worker architecture streams each rendered
//! chunk to the client socket as it is produced, interleaving that
//! with the matching `cache_append` call. Here the whole registry is
//! rendered to an in-memory `Vec<String>` first (matching
//! `matter-labs-vise`'s exporter, which also materializes its whole
//! body before handing it to hyper) and only then walked once to grow
//! both the outgoing body and the cache buffer in lockstep — the same
//! chunk-at-a-time cache bookkeeping the original performs, without
//! needing the cache lock held across the body write back to the
//! client (the HTTP layer only ever sees a complete, already-built
//! response).

use crate::cache::{Cache, WaitKind};
use crate::collectors::{self, ExtensionRow, ServerCollectorInputs, SettingRow};
use crate::config::{Config, ServerRole};
use crate::format;
use crate::logging::LoggingCounters;
use crate::pg::{self, QueryExecutor};
use crate::query::{self, ServerContext};
use crate::registry::Registry;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

/// The outcome of one `/metrics` request, already resolved against
/// the cache. The HTTP layer turns this into headers/status/body; it
/// never re-checks the cache itself.
pub enum ScrapeOutcome {
    /// Served verbatim from a fresh cache entry.
    Cached(Vec<u8>),
    /// Freshly rendered this request (cache disabled, stale, or just
    /// invalidated and repopulated).
    Fresh(Vec<u8>),
    /// The cache lock could not be acquired within `blocking_timeout`
    /// (§7: "close the request with a 500-equivalent").
    CacheBusy,
}

/// Serve one `/metrics` request: resolve against `cache`, opening
/// real backend connections and running every collector only when a
/// fresh render is actually needed.
pub async fn scrape(config: &Config, cache: &Cache, counters: &LoggingCounters) -> ScrapeOutcome {
    if !cache.enabled() {
        return ScrapeOutcome::Fresh(render_fresh_body(config, counters).await);
    }

    let Some(guard) = cache.acquire(WaitKind::Scrape, config.blocking_timeout).await else {
        return ScrapeOutcome::CacheBusy;
    };

    if cache.is_fresh() {
        let body = cache.snapshot();
        drop(guard);
        return ScrapeOutcome::Cached(body);
    }

    cache.invalidate(&guard);
    let chunks = render_fresh_chunks(config, counters).await;

    let mut body = Vec::new();
    let mut overflowed = false;
    for chunk in &chunks {
        body.extend_from_slice(chunk.as_bytes());
        if !overflowed && !cache.append(&guard, chunk.as_bytes()) {
            overflowed = true;
        }
    }
    if !overflowed {
        cache.finalize(&guard);
    }
    drop(guard);

    ScrapeOutcome::Fresh(body)
}

async fn render_fresh_body(config: &Config, counters: &LoggingCounters) -> Vec<u8> {
    render_fresh_chunks(config, counters)
        .await
        .into_iter()
        .flat_map(String::into_bytes)
        .collect()
}

async fn render_fresh_chunks(config: &Config, counters: &LoggingCounters) -> Vec<String> {
    let now = SystemTime::now();
    let mut connections: Vec<Option<pg::Connection>> = Vec::with_capacity(config.servers.len());
    for server in &config.servers {
        match pg::Connection::connect(server).await {
            Ok(conn) => connections.push(Some(conn)),
            Err(err) => {
                tracing::warn!(server = %server.name, error = %err, "failed to connect, skipping for this scrape");
                connections.push(None);
            }
        }
    }

    let servers: Vec<ServerContext<'_>> = config
        .servers
        .iter()
        .zip(connections.iter())
        .map(|(cfg, conn)| ServerContext {
            config: cfg,
            version: conn.as_ref().map(pg::Connection::version).unwrap_or((0, 0)),
            role: conn.as_ref().map(pg::Connection::role).unwrap_or(cfg.role),
        })
        .collect();
    let conn_refs: Vec<Option<&pg::Connection>> = connections.iter().map(Option::as_ref).collect();

    let mut registry = Registry::new();
    populate_registry(&mut registry, config, &servers, &conn_refs, counters, now).await;
    format::render_chunks(&registry)
}

/// Run every built-in collector (§4.7, fixed order) followed by every
/// allow-listed custom metric (§4.5), against already-open
/// connections. Generic over [`QueryExecutor`] so this is exercised
/// in tests against [`crate::pg::FakeExecutor`] without a live
/// PostgreSQL server.
pub async fn populate_registry<E: QueryExecutor + Sync>(
    registry: &mut Registry,
    config: &Config,
    servers: &[ServerContext<'_>],
    connections: &[Option<&E>],
    counters: &LoggingCounters,
    now: SystemTime,
) {
    collectors::collect_state(registry, now);
    collectors::collect_logging(registry, counters, now);
    collectors::collect_version(registry, now);

    let mut setting_rows: Vec<SettingRow> = Vec::new();
    let mut extension_rows: Vec<ExtensionRow> = Vec::new();

    for (ctx, conn) in servers.iter().zip(connections.iter()) {
        let conn: Option<&E> = *conn;
        let version = conn.map(|_| ctx.version);
        let is_primary = conn.map(|_| ctx.role == ServerRole::Primary);
        let uptime_seconds = match conn {
            Some(c) => fetch_uptime(c).await,
            None => None,
        };

        let input = ServerCollectorInputs {
            config: ctx.config,
            connection: conn.map(|c| c as &(dyn QueryExecutor + Sync)),
            version,
            is_primary,
            uptime_seconds,
        };
        collectors::collect_server_active(registry, &input, now);
        collectors::collect_server_version(registry, &input, now);
        collectors::collect_server_primary(registry, &input, now);
        collectors::collect_server_uptime(registry, &input, now);

        let Some(c) = conn else { continue };

        match c.execute("SELECT name, setting FROM pg_settings").await {
            Ok(rows) => {
                for row in rows {
                    setting_rows.push(SettingRow {
                        server: ctx.config.name.clone(),
                        name: row.get_text(0).unwrap_or_default(),
                        raw_value: row.get_text(1),
                    });
                }
            }
            Err(err) => {
                tracing::warn!(server = %ctx.config.name, error = %err, "pg_settings query failed, skipping");
            }
        }

        match c
            .execute(
                "SELECT extname, extversion, COALESCE(obj_description(oid, 'pg_extension'), '') \
                 FROM pg_extension",
            )
            .await
        {
            Ok(rows) => {
                for row in rows {
                    extension_rows.push(ExtensionRow {
                        server: ctx.config.name.clone(),
                        extension: row.get_text(0).unwrap_or_default(),
                        version: row.get_text(1).unwrap_or_default(),
                        comment: row.get_text(2).unwrap_or_default(),
                    });
                }
            }
            Err(err) => {
                tracing::warn!(server = %ctx.config.name, error = %err, "pg_extension query failed, skipping");
            }
        }

        if ctx.config.extension.load(Ordering::Relaxed) {
            match collectors::discover_extension_functions(c).await {
                Ok(functions) => {
                    collectors::collect_extension_functions(registry, ctx.config, c, &functions, now)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(
                        server = %ctx.config.name,
                        error = %err,
                        "extension function discovery failed, disabling for this server"
                    );
                    ctx.config.extension.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    collectors::collect_settings(registry, &setting_rows, now);
    collectors::collect_extension_info(registry, &extension_rows, now);

    query::run_custom_metrics(registry, &config.metrics, servers, connections, |name| {
        config.collector_allowed(name)
    }, now)
    .await;
}

async fn fetch_uptime<E: QueryExecutor>(conn: &E) -> Option<String> {
    let rows = conn
        .execute("SELECT extract(epoch from now() - pg_postmaster_start_time())::text")
        .await
        .ok()?;
    rows.into_iter().next()?.get_text(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::pg::FakeExecutor;
    use crate::registry::FamilyValue;
    use std::sync::atomic::AtomicBool;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            dbname: "postgres".to_string(),
            role: ServerRole::Primary,
            data_directory: None,
            wal_directory: None,
            extension: AtomicBool::new(false),
            installed_extensions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn empty_server_list_still_emits_fixed_builtins() {
        let config = crate::config::test_config();
        let counters = LoggingCounters::default();
        let mut registry = Registry::new();
        let servers: Vec<ServerContext<'_>> = Vec::new();
        let connections: Vec<Option<&FakeExecutor>> = Vec::new();

        populate_registry(&mut registry, &config, &servers, &connections, &counters, SystemTime::now())
            .await;

        let names: Vec<&str> = registry.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"pgexporter_state"));
        assert!(names.contains(&"pgexporter_logging_info"));
        assert!(names.contains(&"pgexporter_version"));
    }

    #[tokio::test]
    async fn connected_server_yields_active_settings_and_extension_families() {
        let mut config = crate::config::test_config();
        let s1 = server("s1");
        config.servers.push(s1);
        let counters = LoggingCounters::default();
        let mut registry = Registry::new();

        let servers: Vec<ServerContext<'_>> = config
            .servers
            .iter()
            .map(|cfg| ServerContext { config: cfg, version: (15, 4), role: ServerRole::Primary })
            .collect();

        let fake = FakeExecutor::new(vec![
            Ok(vec![FakeExecutor::row(&[Some("3600")])]),
            Ok(vec![FakeExecutor::row(&[Some("max_connections"), Some("100")])]),
            Ok(vec![FakeExecutor::row(&[Some("pg_stat_statements"), Some("1.9"), Some("tracks stats")])]),
        ]);
        let connections: Vec<Option<&FakeExecutor>> = vec![Some(&fake)];

        populate_registry(&mut registry, &config, &servers, &connections, &counters, SystemTime::now())
            .await;

        let active = registry.iter().find(|f| f.name == "pgexporter_postgresql_active").unwrap();
        let FamilyValue::Plain(series) = &active.value else {
            panic!("expected plain family")
        };
        assert_eq!(series[0].samples[0].value, "1");

        let settings = registry.iter().find(|f| f.name == "pgexporter_max_connections").unwrap();
        let FamilyValue::Plain(series) = &settings.value else {
            panic!("expected plain family")
        };
        assert_eq!(series[0].samples[0].value, "100");

        let extensions = registry
            .iter()
            .find(|f| f.name == "pgexporter_postgresql_extension_info")
            .unwrap();
        let FamilyValue::Plain(series) = &extensions.value else {
            panic!("expected plain family")
        };
        assert_eq!(series.len(), 1);
    }

    #[tokio::test]
    async fn disconnected_server_reports_inactive_without_failing() {
        let mut config = crate::config::test_config();
        config.servers.push(server("s1"));
        let counters = LoggingCounters::default();
        let mut registry = Registry::new();
        let servers: Vec<ServerContext<'_>> = config
            .servers
            .iter()
            .map(|cfg| ServerContext { config: cfg, version: (0, 0), role: ServerRole::Primary })
            .collect();
        let connections: Vec<Option<&FakeExecutor>> = vec![None];

        populate_registry(&mut registry, &config, &servers, &connections, &counters, SystemTime::now())
            .await;

        let active = registry.iter().find(|f| f.name == "pgexporter_postgresql_active").unwrap();
        let FamilyValue::Plain(series) = &active.value else {
            panic!("expected plain family")
        };
        assert_eq!(series[0].samples[0].value, "0");
    }

    #[tokio::test]
    async fn scrape_with_disabled_cache_renders_fresh_every_time() {
        let config = crate::config::test_config();
        let cache = Cache::new(std::time::Duration::ZERO, 1024, config.metrics_port);
        let counters = LoggingCounters::default();

        match scrape(&config, &cache, &counters).await {
            ScrapeOutcome::Fresh(body) => {
                assert!(!body.is_empty());
                assert!(String::from_utf8_lossy(&body).contains("pgexporter_state"));
            }
            _ => panic!("expected a fresh render with the cache disabled"),
        }
    }

    #[tokio::test]
    async fn scrape_caches_second_request_byte_identical() {
        let config = crate::config::test_config();
        let cache = Cache::new(std::time::Duration::from_secs(60), 1024 * 1024, config.metrics_port);
        let counters = LoggingCounters::default();

        let first = match scrape(&config, &cache, &counters).await {
            ScrapeOutcome::Fresh(body) => body,
            _ => panic!("expected a fresh render on the first request"),
        };
        let second = match scrape(&config, &cache, &counters).await {
            ScrapeOutcome::Cached(body) => body,
            _ => panic!("expected the second request to hit the cache"),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn scrape_overflowing_cache_still_returns_full_body() {
        let config = crate::config::test_config();
        let cache = Cache::new(std::time::Duration::from_secs(60), 8, config.metrics_port);
        let counters = LoggingCounters::default();

        let body = match scrape(&config, &cache, &counters).await {
            ScrapeOutcome::Fresh(body) => body,
            _ => panic!("expected a fresh render"),
        };
        assert!(!body.is_empty());
        assert!(!cache.is_fresh());
    }
}
