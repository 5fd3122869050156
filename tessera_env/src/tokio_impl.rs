//! Production implementation of NodeContext using Tokio.

use crate::types::Tick;
use crate::NodeContext;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Production context backed by Tokio and OS entropy.
///
/// Ticks are derived from the wall clock so that independently started nodes
/// agree on the tick number to within clock skew.
pub struct TokioContext {
    /// Length of one tick
    tick_period: Duration,

    /// Entropy for claim jitter
    rng: Mutex<StdRng>,
}

impl TokioContext {
    /// Creates a new TokioContext with the given tick period.
    pub fn new(tick_period: Duration) -> Self {
        Self {
            tick_period: tick_period.max(Duration::from_millis(1)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared(tick_period: Duration) -> Arc<Self> {
        Arc::new(Self::new(tick_period))
    }

    /// Returns the configured tick period.
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        // 10 ticks per second
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl NodeContext for TokioContext {
    fn now(&self) -> Tick {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (since_epoch.as_millis() / self.tick_period.as_millis()) as Tick
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_below(&self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..bound)
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_ticks_advance() {
        let ctx = TokioContext::new(Duration::from_millis(5));
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(20)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
    }

    #[test]
    fn test_tokio_context_random_bounds() {
        let ctx = TokioContext::default();
        assert_eq!(ctx.random_below(0), 0);
        for _ in 0..100 {
            assert!(ctx.random_below(5) < 5);
        }
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::default();
        assert_eq!(ctx.seed(), 0);
    }
}
