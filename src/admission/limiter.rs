/// Immediate-admission decision from an external rate limiter
///
/// The counting algorithm (token bucket, fixed window, ...) lives behind
/// this trait. Replenishment is signalled separately through the admission
/// scheduler's ticks.
pub trait RateLimiter: Send + Sync {
    /// Consume one unit of budget for `client_id` if available
    fn try_acquire(&self, client_id: &str) -> bool;
}

impl<F> RateLimiter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn try_acquire(&self, client_id: &str) -> bool {
        self(client_id)
    }
}

/// Limiter that admits everything
///
/// Used when no external limiter is wired in; the queue then only fills up
/// if a limiter is added later.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn try_acquire(&self, _client_id: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_admits() {
        assert!(NoopRateLimiter.try_acquire("anyone"));
    }

    #[test]
    fn test_closure_limiter() {
        let limiter = |client: &str| client == "vip";
        assert!(limiter.try_acquire("vip"));
        assert!(!limiter.try_acquire("other"));
    }
}
