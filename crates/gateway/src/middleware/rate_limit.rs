//! Token-bucket rate limiting for the chat stream
//!
//! Two buckets guard every query: a per-connection limiter owned by the
//! connection driver, and a coarser process-wide limiter keyed by client
//! IP so reconnecting does not reset the budget. Both are checked before
//! any retrieval work starts.

use docpilot_common::config::RateLimitConfig;
use docpilot_common::errors::{AppError, Result};
use docpilot_common::metrics::record_rate_limited;
use governor::clock::{Clock, QuantaClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Per-connection token bucket
pub type ConnectionLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Shared per-identity (IP) token bucket
pub type IdentityLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, QuantaClock>;

fn quota(per_second: u32, burst: u32) -> Quota {
    let rate = NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(rate).allow_burst(burst)
}

/// Build the process-wide identity limiter, shared by every connection
pub fn identity_limiter(config: &RateLimitConfig) -> Arc<IdentityLimiter> {
    Arc::new(RateLimiter::keyed(quota(
        config.identity_per_second,
        config.identity_burst,
    )))
}

/// Both rate-limit checks for one connection
pub struct RateGuard {
    connection: ConnectionLimiter,
    identity: Arc<IdentityLimiter>,
    ip: IpAddr,
    clock: QuantaClock,
    enabled: bool,
}

impl RateGuard {
    pub fn new(config: &RateLimitConfig, identity: Arc<IdentityLimiter>, ip: IpAddr) -> Self {
        Self {
            connection: RateLimiter::direct(quota(
                config.connection_per_second,
                config.connection_burst,
            )),
            identity,
            ip,
            clock: QuantaClock::default(),
            enabled: config.enabled,
        }
    }

    /// Admit or reject one query. A rejection carries how long the
    /// client should wait, from whichever bucket said no.
    pub fn check_query(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if let Err(denied) = self.connection.check() {
            let wait = denied.wait_time_from(self.clock.now()).as_millis() as u64;
            record_rate_limited("connection");
            return Err(AppError::RateLimited {
                retry_after_ms: wait.max(1),
            });
        }

        if let Err(denied) = self.identity.check_key(&self.ip) {
            let wait = denied.wait_time_from(self.clock.now()).as_millis() as u64;
            record_rate_limited("identity");
            return Err(AppError::RateLimited {
                retry_after_ms: wait.max(1),
            });
        }

        Ok(())
    }
}
