//! Node Runtime - drives a node's tick loop against its environment.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 NodeRuntime                  │
//! │   loop {                                     │
//! │     node.tick()      ── one pipeline pass    │
//! │     ctx.sleep(period) ── real or virtual     │
//! │   }                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tessera_core::runtime::{NodeRuntime, RuntimeConfig};
//! use tessera_env::TokioContext;
//!
//! let ctx = TokioContext::shared(Duration::from_millis(100));
//! let runtime = NodeRuntime::new(ctx, RuntimeConfig::default());
//! runtime.run(&mut arbitrator, 600).await;
//! ```

use crate::arbitrator::Arbitrator;
use crate::logic::{ArbitratorLogic, PeerLogic};
use crate::peer::Peer;
use std::sync::Arc;
use std::time::Duration;
use tessera_env::{Messaging, NodeContext, Overlay, Storage};
use tracing::debug;

/// Anything with a per-tick pipeline.
pub trait Tickable {
    fn tick(&mut self);
}

impl<M: Messaging, O: Overlay, S: Storage, L: ArbitratorLogic> Tickable for Arbitrator<M, O, S, L> {
    fn tick(&mut self) {
        Arbitrator::tick(self)
    }
}

impl<M: Messaging, L: PeerLogic> Tickable for Peer<M, L> {
    fn tick(&mut self) {
        Peer::tick(self)
    }
}

/// Configuration for a node runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Node's logical name (for logging)
    pub name: String,

    /// Tick rate in Hz (default: 10)
    pub tick_rate_hz: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "tessera-node".to_string(),
            tick_rate_hz: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate_hz.max(1) as u64)
    }
}

pub struct NodeRuntime {
    ctx: Arc<dyn NodeContext>,
    config: RuntimeConfig,
}

impl NodeRuntime {
    pub fn new(ctx: Arc<dyn NodeContext>, config: RuntimeConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Ticks `node` `ticks` times, sleeping one period after each tick.
    pub async fn run<T: Tickable>(&self, node: &mut T, ticks: u64) -> u64 {
        self.run_until(node, ticks, |_| false).await
    }

    /// Like [`run`](Self::run), but stops early once `done` holds after a
    /// tick. Returns the number of ticks executed.
    pub async fn run_until<T: Tickable>(&self, node: &mut T, max_ticks: u64, mut done: impl FnMut(&T) -> bool) -> u64 {
        let period = self.config.tick_period();
        for executed in 1..=max_ticks {
            node.tick();
            if done(node) {
                debug!("{} finished after {} ticks", self.config.name, executed);
                return executed;
            }
            self.ctx.sleep(period).await;
        }
        max_ticks
    }
}
