//! Pass-through channel to a persistent backing store.

use crate::error::EnvError;
use crate::types::QueryId;

/// Query/response access to the backing store.
///
/// Payloads are opaque to the core; it only routes them and correlates the
/// replies with the request that caused them.
pub trait Storage {
    /// Submits a query and returns the id its reply will carry.
    fn query(&mut self, request: &[u8]) -> QueryId;

    /// Answers a query previously received by the storage side.
    fn respond(&mut self, query: QueryId, reply: &[u8]) -> Result<(), EnvError>;

    /// Drains replies that arrived since the last call.
    fn poll_replies(&mut self) -> Vec<(QueryId, Vec<u8>)>;
}
