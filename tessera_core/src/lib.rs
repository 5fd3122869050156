//! tessera Core - Arbitration and Consistency for Peer-to-Peer Worlds
//!
//! Every object in a tessera world has exactly one arbitrator allowed to
//! change it. This library keeps that true while regions shift, nodes crash
//! and messages get lost:
//! 1. **Replication**: owners push versioned diffs to the peers that can see
//!    an object and to neighboring arbitrators
//! 2. **Ownership**: objects follow their region's arbitrator through an
//!    acknowledged TRANSFER handshake; orphans are claimed after a random delay
//! 3. **Events**: peer events are applied by every affected arbitrator in one
//!    global `(timestamp, sender)` order
//!
//! Nodes are generic over [`tessera_env`] traits, so the same code runs on
//! tokio and inside the deterministic simulator.

pub mod arbitrator;
pub mod attributes;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod gateway;
pub mod interest;
pub mod logic;
mod ownership;
pub mod peer;
pub mod protocol;
pub mod runtime;
pub mod store;
mod wire;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use arbitrator::{Arbitrator, ArbitratorStatus};
pub use attributes::{AttrType, AttrValue, AttributeList, Vec3};
pub use config::ReplicationConfig;
pub use entity::{Event, Object, ObjectId};
pub use error::{CodecError, ProtocolError};
pub use logic::{ArbitratorApi, ArbitratorLogic, PeerLogic};
pub use peer::Peer;
pub use protocol::{MessageTag, WireMessage};
pub use runtime::{NodeRuntime, RuntimeConfig, Tickable};
pub use store::ObjectStore;
