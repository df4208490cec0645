//! The HTTP responder: a raw `hyper`/`hyper-util` HTTP/1 server (no
//! router framework — the teacher's own server is Axum/Tower, but
//! this exporter needs to peek the first bytes of a raw `TcpStream`
//! before any TLS handshake runs, which a router built on top of an
//! already-accepted connection can't do) with an optional TLS
//! front-door and a fixed three-route surface.

use crate::config::Config;
use crate::coordinator::{self, ScrapeOutcome};
use crate::logging::LoggingCounters;
use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONNECTION, CONTENT_TYPE, DATE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use itertools::Itertools;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Everything a connection task needs, cloned (cheaply, via `Arc`)
/// into every accepted connection.
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<crate::cache::Cache>,
    pub counters: Arc<LoggingCounters>,
}

type ResponseBody = BoxBody<Bytes, Infallible>;

fn rfc1123_now() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new()).map_err(|never: Infallible| match never {}).boxed()
}

/// A single-frame streamed body: declares no `Content-Length`, so
/// hyper falls back to `Transfer-Encoding: chunked` on the wire, per
/// §4.4/§4.9's requirement that `/` and `/metrics` bodies be chunked.
fn chunked_body(bytes: Vec<u8>) -> ResponseBody {
    let frame = Frame::data(Bytes::from(bytes));
    StreamBody::new(stream::once(async move { Ok::<_, Infallible>(frame) })).boxed()
}

fn plain_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(DATE, rfc1123_now())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(chunked_body(message.as_bytes().to_vec()))
        .expect("static response headers are always valid")
}

/// Build the static, configuration-driven index page listing the
/// active metric tags. Restored from `original_source`'s `home_page`,
/// which is a fixed/config-driven list rather than a live scrape.
fn render_index_html(config: &Config) -> String {
    let mut names = vec![
        "pgexporter_state".to_string(),
        "pgexporter_logging_info".to_string(),
        "pgexporter_logging_warn".to_string(),
        "pgexporter_logging_error".to_string(),
        "pgexporter_logging_fatal".to_string(),
        "pgexporter_version".to_string(),
        "pgexporter_postgresql_active".to_string(),
        "pgexporter_postgresql_version".to_string(),
        "pgexporter_postgresql_primary".to_string(),
        "pgexporter_postgresql_uptime".to_string(),
        "pgexporter_postgresql_extension_info".to_string(),
    ];
    names.extend(config.metrics.iter().map(|m| m.tag.clone()).sorted());

    let mut html = String::from(
        "<html><head><title>pgexporter</title></head><body><h1>pgexporter</h1><ul>\n",
    );
    for name in names {
        let _ = writeln!(html, "<li>{name}</li>");
    }
    html.push_str("</ul></body></html>\n");
    html
}

async fn metrics_response(state: &AppState) -> Response<ResponseBody> {
    match coordinator::scrape(&state.config, &state.cache, &state.counters).await {
        ScrapeOutcome::Cached(body) | ScrapeOutcome::Fresh(body) => Response::builder()
            .status(StatusCode::OK)
            .header(DATE, rfc1123_now())
            .header(CONTENT_TYPE, "text/plain; version=0.0.1; charset=utf-8")
            .body(chunked_body(body))
            .expect("scrape response headers are always valid"),
        ScrapeOutcome::CacheBusy => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cache busy\n"),
    }
}

async fn route(req: Request<Incoming>, state: Arc<AppState>) -> Response<ResponseBody> {
    if req.method() != Method::GET {
        return plain_response(StatusCode::BAD_REQUEST, "bad request\n");
    }
    match req.uri().path() {
        "/" | "/index.html" => Response::builder()
            .status(StatusCode::OK)
            .header(DATE, rfc1123_now())
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(chunked_body(render_index_html(&state.config).into_bytes()))
            .expect("index response headers are always valid"),
        "/metrics" => metrics_response(&state).await,
        _ => plain_response(StatusCode::FORBIDDEN, "forbidden\n"),
    }
}

/// Bind `listener` and serve forever, one task per accepted
/// connection. `tls` is `Some` when the configuration supplied a
/// certificate/key pair; each connection then runs the TLS
/// front-door detection in [`handle_connection`].
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        let tls = tls.clone();
        let metrics_port = state.config.metrics_port;
        let authentication_timeout = state.config.authentication_timeout;
        tokio::spawn(async move {
            if let Err(err) =
                handle_connection(stream, state, tls, metrics_port, authentication_timeout).await
            {
                tracing::warn!(%peer, error = %err, "connection handling failed");
            }
        });
    }
}

type ConnError = Box<dyn std::error::Error + Send + Sync>;

/// Peek the first 5 bytes per §4.9: byte 0 of `0x16` (TLS handshake)
/// or `0x80` (SSLv2 hello) means this is a real TLS client hello, so
/// run the TLS accept; anything else on a TLS-configured listener is
/// a plaintext request that gets redirected to `https://`.
///
/// The peek and the TLS handshake itself are bounded by
/// `authentication_timeout` (§5's "socket reads and writes (with
/// authentication timeout)" blocking point); a client that never
/// completes its handshake is dropped rather than held open forever.
async fn handle_connection(
    stream: TcpStream,
    state: Arc<AppState>,
    tls: Option<TlsAcceptor>,
    metrics_port: u16,
    authentication_timeout: Duration,
) -> Result<(), ConnError> {
    let Some(acceptor) = tls else {
        let io = TokioIo::new(stream);
        return serve_io(io, state).await;
    };

    let mut peek_buf = [0u8; 5];
    let n = tokio::time::timeout(authentication_timeout, stream.peek(&mut peek_buf)).await??;
    let looks_like_tls = n > 0 && (peek_buf[0] == 0x16 || peek_buf[0] == 0x80);

    if looks_like_tls {
        let tls_stream =
            tokio::time::timeout(authentication_timeout, acceptor.accept(stream)).await??;
        let io = TokioIo::new(tls_stream);
        serve_io(io, state).await
    } else {
        let io = TokioIo::new(stream);
        serve_redirect(io, metrics_port).await
    }
}

async fn serve_io<I>(io: TokioIo<I>, state: Arc<AppState>) -> Result<(), ConnError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }),
        )
        .await?;
    Ok(())
}

/// Serve one plaintext connection with a fixed `301` to the TLS
/// listener, regardless of the requested path (§4.9/§6).
async fn serve_redirect<I>(io: TokioIo<I>, metrics_port: u16) -> Result<(), ConnError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req: Request<Incoming>| async move {
                let path = req
                    .uri()
                    .path_and_query()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string());
                let location = format!("https://localhost:{metrics_port}{path}");
                let response = Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, location)
                    .header(CONNECTION, "close")
                    .header(DATE, rfc1123_now())
                    .body(empty_body())
                    .expect("redirect response headers are always valid");
                Ok::<_, Infallible>(response)
            }),
        )
        .await?;
    Ok(())
}

/// Build the TLS acceptor from a loaded [`crate::config::TlsConfig`],
/// using the same old-style `rustls` 0.21 API `config.rs` already
/// parses certificates/keys with.
pub fn build_tls_acceptor(tls: &crate::config::TlsConfig) -> Result<TlsAcceptor, rustls::Error> {
    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(tls.certificates.clone(), tls.key.clone())?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_html_always_lists_fixed_builtins() {
        let config = crate::config::test_config();
        let html = render_index_html(&config);
        assert!(html.contains("pgexporter_state"));
        assert!(html.contains("pgexporter_logging_info"));
        assert!(html.contains("pgexporter_postgresql_active"));
    }

    #[test]
    fn index_html_includes_sorted_custom_tags() {
        let mut config = crate::config::test_config();
        config.metrics = vec![
            crate::config::MetricDef {
                tag: "zzz_metric".to_string(),
                collector_name: "zzz_metric".to_string(),
                sort_type: crate::config::SortType::Insertion,
                server_query_type: None,
                variants: crate::config::VariantTree::default(),
            },
            crate::config::MetricDef {
                tag: "aaa_metric".to_string(),
                collector_name: "aaa_metric".to_string(),
                sort_type: crate::config::SortType::Insertion,
                server_query_type: None,
                variants: crate::config::VariantTree::default(),
            },
        ];
        let html = render_index_html(&config);
        let aaa_pos = html.find("aaa_metric").unwrap();
        let zzz_pos = html.find("zzz_metric").unwrap();
        assert!(aaa_pos < zzz_pos);
    }

    #[test]
    fn plain_response_carries_a_date_header() {
        let response = plain_response(StatusCode::FORBIDDEN, "forbidden\n");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().contains_key(DATE));
    }
}
