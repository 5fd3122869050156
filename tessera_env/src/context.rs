//! Process-scoped environment context handed to every tessera node.

use crate::types::Tick;
use async_trait::async_trait;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// One context is created per node and passed to its constructor; nothing in
/// the core reads clocks or entropy any other way. This makes a whole world of
/// nodes reproducible from a single seed in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wall clock divided into ticks, OS-seeded RNG
/// - **Simulation**: `SimContext` - shared virtual tick counter, `ChaCha8Rng(seed)`
#[async_trait]
pub trait NodeContext: Send + Sync + 'static {
    /// Returns the current logical time in ticks.
    ///
    /// Ticks are comparable across nodes of the same deployment; events are
    /// ordered by the tick at which their sender created them.
    fn now(&self) -> Tick;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Draws a uniformly distributed integer in `0..bound`.
    ///
    /// Returns 0 when `bound` is 0. Used for claim jitter.
    fn random_below(&self, bound: u32) -> u32;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
