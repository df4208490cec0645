//! Ambient logging, wired through `tracing` but additionally exposed
//! as four running counters (`pgexporter_logging_info/warn/error/fatal`)
//! so the exposed metric set reflects the exporter's own health
//! alongside the PostgreSQL data it collects.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// The four running totals, cheap to clone (an `Arc` around this is
/// unnecessary — the counters themselves are the shared state).
#[derive(Debug, Default)]
pub struct LoggingCounters {
    info: AtomicU64,
    warn: AtomicU64,
    error: AtomicU64,
    fatal: AtomicU64,
}

impl LoggingCounters {
    pub fn info(&self) -> u64 {
        self.info.load(Ordering::Relaxed)
    }

    pub fn warn(&self) -> u64 {
        self.warn.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn fatal(&self) -> u64 {
        self.fatal.load(Ordering::Relaxed)
    }

    fn bump(&self, level: &Level) {
        match *level {
            Level::ERROR => self.error.fetch_add(1, Ordering::Relaxed),
            Level::WARN => self.warn.fetch_add(1, Ordering::Relaxed),
            _ => self.info.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a fatal condition: a startup failure or other event
    /// that stops the process rather than merely being logged.
    /// Distinct from `ERROR` because the exporter does not have a
    /// tracing level past `ERROR` to map it from; callers invoke this
    /// directly at the few sites that mean it.
    pub fn bump_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }
}

struct CountingVisitor;

impl Visit for CountingVisitor {
    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

/// A `tracing_subscriber` layer that taps every event's level and
/// bumps the matching counter, without interfering with whatever
/// formatting layer is also installed.
pub struct CountingLayer {
    counters: std::sync::Arc<LoggingCounters>,
}

impl CountingLayer {
    pub fn new(counters: std::sync::Arc<LoggingCounters>) -> Self {
        CountingLayer { counters }
    }
}

impl<S: Subscriber> Layer<S> for CountingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = CountingVisitor;
        event.record(&mut visitor);
        self.counters.bump(event.metadata().level());
    }
}

/// Install a `tracing_subscriber` registry combining the process's
/// standard formatted output (env-filter controlled, matching the
/// teacher's logging setup) with the counting layer feeding the
/// exporter's own `pgexporter_logging_*` metrics.
pub fn init(counters: std::sync::Arc<LoggingCounters>) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(CountingLayer::new(counters))
        .init();
}
