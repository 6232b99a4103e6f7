use once_cell::sync::Lazy;
use quanta::Clock;

/// Shared high-resolution clock for hot-path timing (rate-limiter refills,
/// cache expiry checks, queue-wait accounting).
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Current instant (precise).
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}
