//! Request pacing for the upstream mail provider
//!
//! The staggered scheduler keeps the number of mailboxes touched per tick low,
//! but a single account sync can still fan out into several requests (token
//! exchange, folder listings, unread count, IMAP sessions). This module paces
//! those requests with a token bucket so a burst of syncs never turns into a
//! burst against the provider:
//! - Tokens refill at `requests_per_second`
//! - Bursting is allowed up to `burst` tokens
//! - Callers wait when the bucket is empty

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;

/// Relative cost of provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCost {
    /// OAuth refresh-token exchange
    TokenExchange,
    /// A single Graph REST call
    RestCall,
    /// One IMAP connection (login + select + fetch)
    ImapSession,
}

impl RequestCost {
    pub fn units(&self) -> u32 {
        match self {
            RequestCost::TokenExchange => 1,
            RequestCost::RestCall => 1,
            RequestCost::ImapSession => 2,
        }
    }
}

/// Token bucket shared by every request the provider client makes
#[derive(Debug)]
pub struct RequestRateLimiter {
    inner: Arc<Mutex<LimiterState>>,
}

#[derive(Debug)]
struct LimiterState {
    available_units: f64,
    max_units: f64,
    refill_rate: f64,
    last_refill: Instant,
    total_consumed: u64,
    total_requests: u64,
}

impl LimiterState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available_units = (self.available_units + elapsed * self.refill_rate).min(self.max_units);
        self.last_refill = now;
    }

    fn consume(&mut self, units: f64) {
        self.available_units -= units;
        self.total_consumed += units as u64;
        self.total_requests += 1;
    }
}

impl RequestRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_config(config.requests_per_second, config.burst)
    }

    /// Create a limiter refilling `refill_rate` units per second up to `max_units`
    pub fn with_config(refill_rate: f64, max_units: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LimiterState {
                available_units: max_units,
                max_units,
                refill_rate,
                last_refill: Instant::now(),
                total_consumed: 0,
                total_requests: 0,
            })),
        }
    }

    /// Wait until the bucket can pay for `cost`, then consume it
    pub async fn acquire(&self, cost: RequestCost) {
        let units_needed = cost.units() as f64;

        loop {
            let wait_time = {
                let mut state = self.inner.lock().await;
                state.refill();

                trace!(
                    "Request budget: {:.1}/{:.1} units available, requesting {:.0}",
                    state.available_units,
                    state.max_units,
                    units_needed
                );

                if state.available_units >= units_needed {
                    state.consume(units_needed);
                    return;
                }

                let deficit = units_needed - state.available_units;
                Duration::from_secs_f64(deficit / state.refill_rate)
            };

            // Wait outside the lock to allow other operations to proceed
            debug!(
                "Request budget exhausted, waiting {:.2}s for {} units",
                wait_time.as_secs_f64(),
                units_needed
            );
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Consume `cost` if available right now
    pub async fn try_acquire(&self, cost: RequestCost) -> bool {
        let units_needed = cost.units() as f64;
        let mut state = self.inner.lock().await;
        state.refill();

        if state.available_units >= units_needed {
            state.consume(units_needed);
            true
        } else {
            false
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut state = self.inner.lock().await;
        state.refill();
        RateLimiterStats {
            available_units: state.available_units,
            total_consumed: state.total_consumed,
            total_requests: state.total_requests,
        }
    }
}

impl Clone for RequestRateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub available_units: f64,
    pub total_consumed: u64,
    pub total_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_cost_units() {
        assert_eq!(RequestCost::TokenExchange.units(), 1);
        assert_eq!(RequestCost::RestCall.units(), 1);
        assert_eq!(RequestCost::ImapSession.units(), 2);
    }

    #[tokio::test]
    async fn test_acquire_immediate() {
        let limiter = RequestRateLimiter::with_config(10.0, 10.0);
        limiter.acquire(RequestCost::ImapSession).await;

        let stats = limiter.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_consumed, 2);
    }

    #[tokio::test]
    async fn test_try_acquire_insufficient_budget() {
        let limiter = RequestRateLimiter::with_config(0.1, 1.0);
        assert!(limiter.try_acquire(RequestCost::RestCall).await);
        // one unit left at most a sliver over zero, not enough for an IMAP session
        assert!(!limiter.try_acquire(RequestCost::ImapSession).await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RequestRateLimiter::with_config(20.0, 2.0);
        limiter.acquire(RequestCost::ImapSession).await;

        let start = Instant::now();
        limiter.acquire(RequestCost::RestCall).await;
        // 1 unit at 20 units/sec is 50ms
        assert!(start.elapsed().as_millis() >= 40, "should have waited for refill");
    }

    #[tokio::test]
    async fn test_clone_shares_budget() {
        let first = RequestRateLimiter::with_config(10.0, 10.0);
        let second = first.clone();

        first.acquire(RequestCost::TokenExchange).await;
        assert_eq!(second.stats().await.total_requests, 1);
    }
}
