//! Prometheus metrics exporter.
//!
//! Gauges are refreshed from the server's atomic counters right before each
//! scrape, the same registry/update split the stats side uses internally.
//! The exporter is optional and never touches the request pipeline.

mod server;

pub use server::start_metrics_server;

use std::sync::Arc;

use prometheus::{Gauge, GaugeVec, Opts, Registry};

use crate::cache::QueryCache;
use crate::dbpool::DbPool;
use crate::stats::ServerStats;

pub struct MetricsContext {
    registry: Registry,
    requests: GaugeVec,
    requests_by_kind: GaugeVec,
    cache_counters: GaugeVec,
    db_pool: GaugeVec,
    in_flight: Gauge,

    stats: Arc<ServerStats>,
    cache: Arc<QueryCache>,
    pool: DbPool,
}

impl MetricsContext {
    pub fn new(stats: Arc<ServerStats>, cache: Arc<QueryCache>, pool: DbPool) -> MetricsContext {
        let registry = Registry::new();

        let requests = GaugeVec::new(
            Opts::new(
                "burrowctl_requests",
                "Request counters by outcome: received, published, rate_limited, server_busy, \
                 bad_envelope, unknown_type, deadline_exceeded, internal_error, publish_failures.",
            ),
            &["outcome"],
        )
        .unwrap();
        registry.register(Box::new(requests.clone())).unwrap();

        let requests_by_kind = GaugeVec::new(
            Opts::new(
                "burrowctl_requests_by_kind",
                "Dispatched requests by kind: sql, function, command.",
            ),
            &["kind"],
        )
        .unwrap();
        registry.register(Box::new(requests_by_kind.clone())).unwrap();

        let cache_counters = GaugeVec::new(
            Opts::new(
                "burrowctl_query_cache",
                "Query cache counters: hits, misses, evictions, expirations, total_requests, \
                 current_size.",
            ),
            &["counter"],
        )
        .unwrap();
        registry.register(Box::new(cache_counters.clone())).unwrap();

        let db_pool = GaugeVec::new(
            Opts::new(
                "burrowctl_db_pool",
                "Database pool state: idle connections, available slots, current users.",
            ),
            &["state"],
        )
        .unwrap();
        registry.register(Box::new(db_pool.clone())).unwrap();

        let in_flight = Gauge::new(
            "burrowctl_in_flight",
            "Work items currently queued or executing.",
        )
        .unwrap();
        registry.register(Box::new(in_flight.clone())).unwrap();

        MetricsContext {
            registry,
            requests,
            requests_by_kind,
            cache_counters,
            db_pool,
            in_flight,
            stats,
            cache,
            pool,
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Refreshes every gauge before a scrape.
    pub(crate) fn update_metrics(&self) {
        let stats = self.stats.snapshot();
        let pairs = [
            ("received", stats.requests_received),
            ("published", stats.responses_published),
            ("publish_failures", stats.publish_failures),
            ("rate_limited", stats.rejected_rate_limited),
            ("server_busy", stats.rejected_server_busy),
            ("bad_envelope", stats.rejected_bad_envelope),
            ("unknown_type", stats.rejected_unknown_type),
            ("deadline_exceeded", stats.deadline_exceeded),
            ("internal_error", stats.internal_errors),
        ];
        for (outcome, value) in pairs {
            self.requests.with_label_values(&[outcome]).set(value as f64);
        }

        for (kind, value) in [
            ("sql", stats.sql_requests),
            ("function", stats.function_requests),
            ("command", stats.command_requests),
        ] {
            self.requests_by_kind
                .with_label_values(&[kind])
                .set(value as f64);
        }

        let cache = self.cache.stats();
        for (counter, value) in [
            ("hits", cache.hits),
            ("misses", cache.misses),
            ("evictions", cache.evictions),
            ("expirations", cache.expirations),
            ("total_requests", cache.total_requests),
            ("current_size", cache.current_size),
        ] {
            self.cache_counters
                .with_label_values(&[counter])
                .set(value as f64);
        }

        let pool = self.pool.status();
        for (state, value) in [
            ("idle", pool.idle),
            ("available", pool.available),
            ("users", pool.users),
        ] {
            self.db_pool.with_label_values(&[state]).set(value as f64);
        }

        self.in_flight.set(stats.in_flight as f64);
    }
}
