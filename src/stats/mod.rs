//! Process-wide request accounting.
//!
//! One instance per server, shared by the consumer, the workers and the
//! metrics exporter. Counters are monotonic; gauges reset on restart only.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests_received: AtomicU64,
    pub responses_published: AtomicU64,
    pub publish_failures: AtomicU64,

    pub rejected_bad_envelope: AtomicU64,
    pub rejected_unknown_type: AtomicU64,
    pub rejected_rate_limited: AtomicU64,
    pub rejected_server_busy: AtomicU64,

    pub sql_requests: AtomicU64,
    pub function_requests: AtomicU64,
    pub command_requests: AtomicU64,

    pub deadline_exceeded: AtomicU64,
    pub internal_errors: AtomicU64,

    /// Work items currently queued or executing.
    pub in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub requests_received: u64,
    pub responses_published: u64,
    pub publish_failures: u64,
    pub rejected_bad_envelope: u64,
    pub rejected_unknown_type: u64,
    pub rejected_rate_limited: u64,
    pub rejected_server_busy: u64,
    pub sql_requests: u64,
    pub function_requests: u64,
    pub command_requests: u64,
    pub deadline_exceeded: u64,
    pub internal_errors: u64,
    pub in_flight: u64,
}

impl ServerStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_published: self.responses_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            rejected_bad_envelope: self.rejected_bad_envelope.load(Ordering::Relaxed),
            rejected_unknown_type: self.rejected_unknown_type.load(Ordering::Relaxed),
            rejected_rate_limited: self.rejected_rate_limited.load(Ordering::Relaxed),
            rejected_server_busy: self.rejected_server_busy.load(Ordering::Relaxed),
            sql_requests: self.sql_requests.load(Ordering::Relaxed),
            function_requests: self.function_requests.load(Ordering::Relaxed),
            command_requests: self.command_requests.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_counters() {
        let stats = ServerStats::default();
        ServerStats::incr(&stats.requests_received);
        ServerStats::incr(&stats.requests_received);
        ServerStats::incr(&stats.rejected_server_busy);

        let snap = stats.snapshot();
        assert_eq!(snap.requests_received, 2);
        assert_eq!(snap.rejected_server_busy, 1);
        assert_eq!(snap.responses_published, 0);
    }
}
