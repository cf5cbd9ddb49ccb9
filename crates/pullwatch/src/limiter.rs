use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default proactive pacing for hosted API endpoints.
///
/// 5000 requests/hour is ~1.4/sec; 10/sec leaves headroom for bursts while
/// the reactive per-URL backoff handles anything the server pushes back on.
pub const DEFAULT_RPS: u32 = 10;

/// A proactive API rate limiter.
///
/// This paces outgoing requests to stay inside a requests-per-second budget,
/// independently of the reactive per-URL backoff ledger. The request layer
/// waits on it before every dispatch when one is configured.
///
/// # Example
///
/// ```ignore
/// use pullwatch::limiter::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::new(10); // 10 requests per second
///
/// // Before each API call:
/// limiter.wait().await;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a new rate limiter with the specified requests per second.
    ///
    /// A zero argument is treated as 1 request per second.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second)
            .unwrap_or_else(|| NonZeroU32::new(1).expect("1 is non-zero"));
        let rate_limiter = RateLimiter::direct(Quota::per_second(rps));

        Self {
            inner: Arc::new(rate_limiter),
        }
    }

    /// Wait until a request is allowed by the rate limiter.
    ///
    /// Blocks (asynchronously) until the rate limit allows another request.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RPS)
    }
}
