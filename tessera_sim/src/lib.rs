//! tessera Deterministic Simulation Harness
//!
//! Runs whole tessera worlds (a gateway, a grid of arbitrators and a crowd of
//! walking peers) inside one process, with every source of non-determinism
//! under control:
//! - **Time**: one virtual tick counter, advanced only by the world
//! - **Network**: an in-memory router with latency, loss, partitions and crashes
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimClock (virtual ticks)                             │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  ┌─────────────┐   Router    ┌─────────────┐                │
//! │  │ Arbitrator  │◄───────────►│ Arbitrator  │   ...          │
//! │  │  (gateway)  │             │     #2      │                │
//! │  └──────▲──────┘             └──────▲──────┘                │
//! │         │                           │                       │
//! │     ┌───┴───┐                   ┌───┴───┐                   │
//! │     │ Peer  │  ...              │ Peer  │  ...              │
//! │     └───────┘                   └───────┘                   │
//! │                                                             │
//! │  SharedOverlay (Voronoi sites)   MemoryStorage (profiles)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tessera_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::OwnerCrash);
//! assert!(result.passed, "{:?}", result.failure_reason);
//! ```

mod context;
mod error;
pub mod logic;
mod network;
mod overlay;
mod runner;
pub mod scenarios;
mod storage;
mod world;

pub use context::{SimClock, SimContext};
pub use error::SimError;
pub use logic::{AppliedEvent, ObserverLogic, WorldLogic};
pub use network::{NetworkStats, SimLink, SimNetworkController};
pub use overlay::{NearestOverlay, SharedOverlay};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use storage::MemoryStorage;
pub use world::{SentEvent, SimArbitrator, SimConfig, SimPeer, SimWorld, WorldStats};
