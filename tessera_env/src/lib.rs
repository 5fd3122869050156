//! tessera Environment Abstraction Layer
//!
//! Everything a tessera node needs from the outside world, behind traits, so
//! the same arbitrator and peer code runs in **Production** (tokio, real
//! sockets) and in the deterministic **Simulation** harness.
//!
//! # What is abstracted
//!
//! - Time and randomness: [`NodeContext`]
//! - Point-to-point messages: [`Messaging`]
//! - Region ownership queries: [`Overlay`]
//! - Backing-store queries: [`Storage`]
//!
//! By deriving all entropy from a single 64-bit seed, any divergence seen in
//! simulation is reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use tessera_env::{NodeContext, Messaging};
//!
//! fn drain<M: Messaging>(ctx: &dyn NodeContext, net: &mut M) {
//!     for delivery in net.receive() {
//!         handle(ctx.now(), delivery);
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod overlay;
mod storage;
mod tokio_impl;
mod types;

pub use context::NodeContext;
pub use error::EnvError;
pub use network::{Delivery, Messaging, NetworkController};
pub use overlay::Overlay;
pub use storage::Storage;
pub use tokio_impl::TokioContext;
pub use types::{NodeDescriptor, NodeId, Position, QueryId, Tick};
