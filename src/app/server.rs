//! Server lifecycle.
//!
//! Startup order: database pool, cache, rate limiter, registry bind, broker
//! connect, janitors, workers, consumer. Shutdown on SIGTERM/SIGINT walks
//! the same list backwards: stop consuming, drain the worker queue within
//! `drain_timeout` (in-flight replies still publish), close the broker,
//! close the pool, stop the janitors. A second signal aborts the drain.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use log::{error, info, warn};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;

use crate::broker::{Broker, Publisher};
use crate::cache::QueryCache;
use crate::config::Config;
use crate::dbpool::DbPool;
use crate::dispatch::Dispatcher;
use crate::errors::Error;
use crate::functions::Registry;
use crate::limiter::RateLimiter;
use crate::prometheus::{start_metrics_server, MetricsContext};
use crate::protocol::{Request, RequestKind, Response};
use crate::sql::SqlExecutor;
use crate::stats::ServerStats;
use crate::utils::clock;
use crate::workers::{clamp_deadline, WorkHandler, WorkItem, WorkerPool};

/// Upper bound on how long intake blocks waiting for queue space; beyond
/// this the consumer must keep reading control traffic.
const ENQUEUE_WAIT_CAP: Duration = Duration::from_secs(5);

/// Publishes a reply (when the request named a reply queue) and always
/// acknowledges afterwards, never before.
async fn publish_and_ack(
    publisher: &Publisher,
    stats: &ServerStats,
    reply_to: Option<&str>,
    correlation_id: &str,
    response: &Response,
    acker: Option<&Acker>,
) {
    match reply_to {
        Some(reply_to) => match publisher.publish(reply_to, correlation_id, response).await {
            Ok(()) => ServerStats::incr(&stats.responses_published),
            Err(e) => {
                ServerStats::incr(&stats.publish_failures);
                error!("publishing reply for {correlation_id:?} failed: {e}");
            }
        },
        None => warn!("request {correlation_id:?} carries no reply_to, dropping response"),
    }

    if let Some(acker) = acker {
        if let Err(e) = acker.ack(BasicAckOptions::default()).await {
            warn!("ack for {correlation_id:?} failed: {e}");
        }
    }
}

/// The worker-side half of the pipeline: dispatch, publish, ack.
struct PipelineHandler {
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
    stats: Arc<ServerStats>,
}

impl WorkHandler for PipelineHandler {
    fn handle(&self, item: WorkItem) -> BoxFuture<'static, ()> {
        let dispatcher = self.dispatcher.clone();
        let publisher = self.publisher.clone();
        let stats = self.stats.clone();

        Box::pin(async move {
            let response = dispatcher
                .dispatch(item.kind, &item.request, item.budget())
                .await;
            publish_and_ack(
                &publisher,
                &stats,
                item.reply_to.as_deref(),
                &item.request.id,
                &response,
                item.acker.as_ref(),
            )
            .await;
            stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        })
    }
}

struct Intake {
    config: Config,
    stats: Arc<ServerStats>,
    limiter: Arc<RateLimiter>,
    publisher: Publisher,
}

impl Intake {
    /// Admission control for one delivery: decode, classify, rate-limit,
    /// enqueue. Every terminal rejection is published and acked here.
    async fn admit(&self, workers: &WorkerPool, delivery: Delivery) {
        ServerStats::incr(&self.stats.requests_received);

        let data = delivery.data;
        let properties = delivery.properties;
        let acker = delivery.acker;
        let reply_to = properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str().to_string());

        let request = match Request::decode(&data) {
            Ok(request) => request,
            Err(err) => {
                ServerStats::incr(&self.stats.rejected_bad_envelope);
                // fall back to the transport correlation id for the reply
                let correlation_id = properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default();
                self.reject(reply_to.as_deref(), &correlation_id, &err, &acker)
                    .await;
                return;
            }
        };

        let kind = match request.parsed_kind() {
            Ok(kind) => kind,
            Err(err) => {
                ServerStats::incr(&self.stats.rejected_unknown_type);
                self.reject(reply_to.as_deref(), &request.id, &err, &acker)
                    .await;
                return;
            }
        };

        if !self.limiter.admit(&request.client_id) {
            ServerStats::incr(&self.stats.rejected_rate_limited);
            let err = Error::RateLimited(request.client_id.clone());
            self.reject(reply_to.as_deref(), &request.id, &err, &acker)
                .await;
            return;
        }

        let deadline = clamp_deadline(request.deadline_ms, &self.config.general);
        let item = WorkItem {
            request,
            kind,
            reply_to,
            acker: Some(acker),
            received_at: clock::now(),
            deadline,
        };

        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        let wait = deadline.min(ENQUEUE_WAIT_CAP);
        if let Err((err, mut item)) = workers.enqueue(item, wait).await {
            self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            if matches!(err, Error::ServerBusy) {
                ServerStats::incr(&self.stats.rejected_server_busy);
            }
            if let Some(acker) = item.acker.take() {
                self.reject(
                    item.reply_to.as_deref(),
                    &item.request.id,
                    &err,
                    &acker,
                )
                .await;
            }
        }
    }

    async fn reject(
        &self,
        reply_to: Option<&str>,
        correlation_id: &str,
        err: &Error,
        acker: &Acker,
    ) {
        publish_and_ack(
            &self.publisher,
            &self.stats,
            reply_to,
            correlation_id,
            &Response::from_error(err),
            Some(acker),
        )
        .await;
    }
}

pub async fn run_server(config: Config, registry: Registry) -> Result<(), Error> {
    config.show();

    let stats = Arc::new(ServerStats::default());
    let pool = DbPool::new(&config.database)?;
    let cache = Arc::new(QueryCache::new(&config.cache, config.general.workers));
    let limiter = Arc::new(RateLimiter::new(&config.limiter, config.general.workers));
    let registry = Arc::new(registry);
    info!("Function registry bound with {} function(s)", registry.len());

    let prefetch = config.general.queue_size.min(u16::MAX as usize) as u16;
    let broker = Broker::connect(&config.broker, prefetch).await?;
    let publisher = broker.publisher();

    let dispatcher = Arc::new(Dispatcher::new(
        SqlExecutor::new(pool.clone(), cache.clone()),
        registry,
        stats.clone(),
    ));
    let handler = Arc::new(PipelineHandler {
        dispatcher,
        publisher: publisher.clone(),
        stats: stats.clone(),
    });
    let workers = WorkerPool::spawn(config.general.workers, config.general.queue_size, handler);

    // Janitors and the optional metrics exporter stop via the watch flag.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();
    background.push(tokio::spawn(limiter.clone().run_janitor(shutdown_rx.clone())));
    background.push(tokio::spawn(cache.clone().run_janitor(shutdown_rx.clone())));
    if config.metrics.enabled {
        let ctx = Arc::new(MetricsContext::new(
            stats.clone(),
            cache.clone(),
            pool.clone(),
        ));
        let addr = format!("{}:{}", config.metrics.host, config.metrics.port);
        background.push(tokio::spawn(start_metrics_server(ctx, addr, shutdown_rx.clone())));
    }

    let mut consumer = broker.consume().await?;
    let mut sigterm = unix_signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = unix_signal(SignalKind::interrupt()).expect("install SIGINT handler");

    let intake = Intake {
        config: config.clone(),
        stats: stats.clone(),
        limiter,
        publisher,
    };

    info!("Waiting for requests");
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Got SIGTERM, starting graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Got SIGINT, starting graceful shutdown");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => intake.admit(&workers, delivery).await,
                    Some(Err(e)) => error!("consumer error: {e}"),
                    None => {
                        error!("consumer stream closed by the broker");
                        break;
                    }
                }
            }
        }
    }

    // (1) no new deliveries
    broker.stop_consuming().await;

    // (2)+(3) drain; a second signal skips the wait
    let drain = config.general.drain_timeout.as_std();
    let drained = tokio::select! {
        drained = workers.shutdown(drain) => drained,
        _ = sigterm.recv() => false,
        _ = sigint.recv() => false,
    };
    if drained {
        info!("Worker queue drained");
    } else {
        warn!(
            "Drain did not finish within {}, aborting outstanding work",
            config.general.drain_timeout
        );
        workers.shutdown(Duration::ZERO).await;
    }

    // (4) broker, (5) database, (6) janitors
    broker.close().await;
    pool.close();
    let _ = shutdown_tx.send(true);
    for task in background {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}
