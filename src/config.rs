//! Read-only exporter configuration, assembled once at startup from
//! two YAML documents (main config + metric definitions).
//!
//! Follows the teacher's shape: `Deserialize`-derived "file" structs
//! that are fallibly converted (`TryFrom`-style free functions) into
//! the immutable runtime structs the rest of the crate actually
//! reads, with a dedicated error enum collecting every way that
//! conversion can fail.

use duration_string::DurationString;
use serde::Deserialize;
use std::fmt;
use std::io::Cursor;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// A server's replication role, used both to pick a query variant
/// and to gate custom metrics via `server_query_type`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Primary,
    Replica,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerRole::Primary => write!(f, "primary"),
            ServerRole::Replica => write!(f, "replica"),
        }
    }
}

/// A column's kind within a custom metric's result set.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Label,
    Gauge,
    Counter,
    Histogram,
}

/// How series within a merged custom-metric family should be
/// ordered: by the metric's declared tag name, by the first
/// non-label column's raw value, or left in arrival (insertion)
/// order.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortType {
    #[default]
    Insertion,
    TagName,
    FirstColumn,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

/// One version/role-scoped SQL statement. `None` for `min_version`/
/// `max_version`/`role` means "no constraint on this axis".
#[derive(Debug, Clone)]
pub struct QueryVariant {
    pub min_version: Option<(u32, u32)>,
    pub max_version: Option<(u32, u32)>,
    pub role: Option<ServerRole>,
    pub sql: String,
    pub columns: Vec<ColumnDef>,
}

impl QueryVariant {
    /// Whether this variant applies to a server at `version` with
    /// the given `role`.
    pub fn matches(&self, version: (u32, u32), role: ServerRole) -> bool {
        if let Some(min) = self.min_version {
            if version < min {
                return false;
            }
        }
        if let Some(max) = self.max_version {
            if version > max {
                return false;
            }
        }
        if let Some(required) = self.role {
            if required != role {
                return false;
            }
        }
        true
    }
}

/// All the version/role-scoped variants for one custom metric.
#[derive(Debug, Clone, Default)]
pub struct VariantTree {
    pub variants: Vec<QueryVariant>,
}

impl VariantTree {
    /// Select the first variant matching `version`/`role`. Variants
    /// are tried in declaration order, so an operator orders the
    /// most specific variant first.
    pub fn select(&self, version: (u32, u32), role: ServerRole) -> Option<&QueryVariant> {
        self.variants.iter().find(|v| v.matches(version, role))
    }
}

/// One custom, operator-defined metric.
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub tag: String,
    pub collector_name: String,
    pub sort_type: SortType,
    /// `None` means "applies regardless of server role".
    pub server_query_type: Option<ServerRole>,
    pub variants: VariantTree,
}

/// Runtime record for one configured PostgreSQL backend. The
/// `extension` flag is the one field that mutates after load: it
/// latches `true -> false` on a probe failure and never flips back,
/// so it is an `AtomicBool` even though the rest of `Config` is
/// read-only for the process's lifetime.
#[derive(Debug)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub role: ServerRole,
    pub data_directory: Option<String>,
    pub wal_directory: Option<String>,
    pub extension: AtomicBool,
    pub installed_extensions: Vec<String>,
}

impl ServerConfig {
    /// The PostgreSQL connection-string fragment `tokio_postgres`
    /// expects; password, if any, is supplied out-of-band (e.g. via
    /// `PGPASSWORD`/`.pgpass`) rather than stored here.
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} user={} dbname={}",
            self.host, self.port, self.user, self.dbname
        )
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub certificates: Vec<rustls::Certificate>,
    pub key: rustls::PrivateKey,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_age: Duration,
    pub max_size: usize,
}

impl CacheConfig {
    /// The cache is disabled entirely when either `max_age` is zero
    /// or the metrics port itself is zero (§4.8).
    pub fn enabled(&self, metrics_port: u16) -> bool {
        self.max_age > Duration::ZERO && metrics_port != 0
    }
}

/// The fully assembled, read-only exporter configuration.
#[derive(Debug)]
pub struct Config {
    pub host: IpAddr,
    pub metrics_port: u16,
    pub blocking_timeout: Duration,
    pub authentication_timeout: Duration,
    pub cache: CacheConfig,
    pub tls: Option<TlsConfig>,
    pub servers: Vec<ServerConfig>,
    pub metrics: Vec<MetricDef>,
    pub collector_allowlist: Vec<String>,
}

impl Config {
    /// Whether `name` is allowed to run, per the configured
    /// allow-list. An empty allow-list means "allow everything" —
    /// the common case of an operator who hasn't opted into
    /// restricting custom collectors.
    pub fn collector_allowed(&self, name: &str) -> bool {
        self.collector_allowlist.is_empty()
            || self.collector_allowlist.iter().any(|n| n == name)
    }
}

// ---- on-disk ("file") shapes -------------------------------------------------

#[derive(Debug, Deserialize)]
struct CacheConfigFile {
    #[serde(default = "default_max_age")]
    max_age: DurationString,
    #[serde(default = "default_max_size")]
    max_size: usize,
}

fn default_max_age() -> DurationString {
    DurationString::new(Duration::from_secs(60))
}

fn default_max_size() -> usize {
    256 * 1024
}

/// Upper bound on the cache's `max_size`, regardless of what an
/// operator configures (§4.8). Keeps a misconfigured `max_size` from
/// growing the in-memory cache body without limit.
const HARD_MAX: usize = 10 * 1024 * 1024;

fn default_blocking_timeout() -> DurationString {
    DurationString::new(Duration::from_secs(30))
}

fn default_authentication_timeout() -> DurationString {
    DurationString::new(Duration::from_secs(5))
}

#[derive(Debug, Deserialize)]
struct TlsConfigFile {
    certificate_file: PathBuf,
    key_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ServerConfigFile {
    name: String,
    host: String,
    #[serde(default = "default_pg_port")]
    port: u16,
    user: String,
    dbname: String,
    role: ServerRole,
    #[serde(default)]
    data_directory: Option<String>,
    #[serde(default)]
    wal_directory: Option<String>,
    #[serde(default)]
    installed_extensions: Vec<String>,
}

fn default_pg_port() -> u16 {
    5432
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default = "default_host")]
    host: IpAddr,
    metrics_port: u16,
    #[serde(default = "default_blocking_timeout")]
    blocking_timeout: DurationString,
    #[serde(default = "default_authentication_timeout")]
    authentication_timeout: DurationString,
    #[serde(default)]
    cache: Option<CacheConfigFile>,
    #[serde(default)]
    tls: Option<TlsConfigFile>,
    #[serde(default)]
    servers: Vec<ServerConfigFile>,
    #[serde(default)]
    collectors: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

#[derive(Debug, Deserialize)]
struct ColumnFile {
    name: String,
    kind: ColumnKind,
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    #[serde(default)]
    min_version: Option<String>,
    #[serde(default)]
    max_version: Option<String>,
    #[serde(default)]
    role: Option<ServerRole>,
    sql: String,
    columns: Vec<ColumnFile>,
}

#[derive(Debug, Deserialize)]
struct MetricDefFile {
    tag: String,
    collector_name: String,
    #[serde(default)]
    sort_type: SortType,
    #[serde(default)]
    server_query_type: Option<ServerRole>,
    variants: Vec<VariantFile>,
}

#[derive(Debug, Deserialize)]
struct MetricsFile {
    #[serde(default)]
    metrics: Vec<MetricDefFile>,
}

#[derive(Debug)]
pub enum LoadConfigError {
    Read(std::io::Error),
    Parse(serde_yaml::Error),
    InvalidVersion(String),
    CertificateRead(std::io::Error),
    KeyRead(std::io::Error),
    NoPrivateKey(PathBuf),
}

impl fmt::Display for LoadConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadConfigError::Read(e) => write!(f, "cannot read configuration: {e}"),
            LoadConfigError::Parse(e) => write!(f, "cannot parse configuration: {e}"),
            LoadConfigError::InvalidVersion(v) => write!(f, "invalid version string: {v:?}"),
            LoadConfigError::CertificateRead(e) => write!(f, "cannot read certificate file: {e}"),
            LoadConfigError::KeyRead(e) => write!(f, "cannot read key file: {e}"),
            LoadConfigError::NoPrivateKey(p) => {
                write!(f, "{} contains no usable private key", p.display())
            }
        }
    }
}

impl std::error::Error for LoadConfigError {}

impl From<std::io::Error> for LoadConfigError {
    fn from(err: std::io::Error) -> Self {
        LoadConfigError::Read(err)
    }
}

impl From<serde_yaml::Error> for LoadConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        LoadConfigError::Parse(err)
    }
}

/// Parse a `"15.4"`-style version string into `(major, minor)`.
pub fn parse_version(s: &str) -> Result<(u32, u32), LoadConfigError> {
    let mut parts = s.splitn(2, '.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| LoadConfigError::InvalidVersion(s.to_string()))?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major, minor))
}

fn load_tls(file: TlsConfigFile) -> Result<TlsConfig, LoadConfigError> {
    let cert_bytes =
        std::fs::read(&file.certificate_file).map_err(LoadConfigError::CertificateRead)?;
    let mut cert_cursor = Cursor::new(cert_bytes);
    let certs = rustls_pemfile::certs(&mut cert_cursor)
        .map_err(LoadConfigError::CertificateRead)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key_bytes = std::fs::read(&file.key_file).map_err(LoadConfigError::KeyRead)?;
    let mut key_cursor = Cursor::new(key_bytes);
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut key_cursor).map_err(LoadConfigError::KeyRead)?;
    if keys.is_empty() {
        key_cursor.set_position(0);
        keys = rustls_pemfile::rsa_private_keys(&mut key_cursor).map_err(LoadConfigError::KeyRead)?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| LoadConfigError::NoPrivateKey(file.key_file.clone()))?;

    Ok(TlsConfig {
        certificates: certs,
        key,
    })
}

fn convert_server(file: ServerConfigFile) -> ServerConfig {
    ServerConfig {
        name: file.name,
        host: file.host,
        port: file.port,
        user: file.user,
        dbname: file.dbname,
        role: file.role,
        data_directory: file.data_directory,
        wal_directory: file.wal_directory,
        extension: AtomicBool::new(true),
        installed_extensions: file.installed_extensions,
    }
}

fn convert_metric(file: MetricDefFile) -> Result<MetricDef, LoadConfigError> {
    let variants = file
        .variants
        .into_iter()
        .map(|v| {
            Ok(QueryVariant {
                min_version: v.min_version.map(|s| parse_version(&s)).transpose()?,
                max_version: v.max_version.map(|s| parse_version(&s)).transpose()?,
                role: v.role,
                sql: v.sql,
                columns: v
                    .columns
                    .into_iter()
                    .map(|c| ColumnDef {
                        name: c.name,
                        kind: c.kind,
                    })
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>, LoadConfigError>>()?;

    Ok(MetricDef {
        tag: file.tag,
        collector_name: file.collector_name,
        sort_type: file.sort_type,
        server_query_type: file.server_query_type,
        variants: VariantTree { variants },
    })
}

/// Load the main exporter configuration from `path`.
pub fn load_config(path: &Path) -> Result<Config, LoadConfigError> {
    let text = std::fs::read_to_string(path)?;
    let file: ConfigFile = serde_yaml::from_str(&text)?;

    let cache_file = file.cache.unwrap_or(CacheConfigFile {
        max_age: default_max_age(),
        max_size: default_max_size(),
    });

    let tls = file.tls.map(load_tls).transpose()?;

    Ok(Config {
        host: file.host,
        metrics_port: file.metrics_port,
        blocking_timeout: file.blocking_timeout.into(),
        authentication_timeout: file.authentication_timeout.into(),
        cache: CacheConfig {
            max_age: cache_file.max_age.into(),
            max_size: cache_file.max_size.min(HARD_MAX),
        },
        tls,
        servers: file.servers.into_iter().map(convert_server).collect(),
        metrics: Vec::new(),
        collector_allowlist: file.collectors,
    })
}

/// Load the custom-metric definitions from `path` and graft them
/// onto an already-loaded `Config`.
pub fn load_metrics(config: &mut Config, path: &Path) -> Result<(), LoadConfigError> {
    let text = std::fs::read_to_string(path)?;
    let file: MetricsFile = serde_yaml::from_str(&text)?;
    config.metrics = file
        .metrics
        .into_iter()
        .map(convert_metric)
        .collect::<Result<Vec<_>, LoadConfigError>>()?;
    Ok(())
}

/// Build a minimal, server-less configuration useful for tests and
/// for `cfg(test)` scaffolding elsewhere in the crate.
#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        host: default_host(),
        metrics_port: 9187,
        blocking_timeout: Duration::from_secs(30),
        authentication_timeout: Duration::from_secs(5),
        cache: CacheConfig {
            max_age: Duration::from_secs(60),
            max_size: default_max_size(),
        },
        tls: None,
        servers: Vec::new(),
        metrics: Vec::new(),
        collector_allowlist: Vec::new(),
    }
}
