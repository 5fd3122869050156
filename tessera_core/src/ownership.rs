//! Ownership-Transfer Protocol
//!
//! Exactly one arbitrator should hold an object in its ownership set. As
//! regions move, ownership follows the overlay's `closest_to`:
//!
//! ```text
//!  Owned ──(region lost)──► Relinquishing ──► InTransit ──(TRANSFER_ACK)──► done
//!                                                 │
//!                                                 └─(deadline)──► reclaim (self TRANSFER)
//!
//!  Unowned, in my region ──(random countdown, no TRANSFER seen)──► Claimed
//! ```
//!
//! Claims and reclaims are TRANSFER messages addressed to the claimant itself
//! with `orig_owner = UNASSIGNED`; they are applied on the next tick exactly
//! like a transfer received from a neighbor.

use crate::arbitrator::ArbitratorState;
use crate::entity::ObjectId;
use crate::protocol::{TransferAckMsg, TransferMsg, WireMessage};
use crate::store::TransferRecord;
use tessera_env::{Messaging, NodeId, Overlay, Storage};
use tracing::{debug, info, warn};

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorState<M, O, S> {
    /// Hands off owned objects that left my region, retries stalled handovers
    /// and claims orphans that fell into it.
    pub(crate) fn check_owner_transfer(&mut self) {
        let now = self.now();
        let self_id = self.id();

        for id in self.store.owned_ids() {
            let Some(obj) = self.store.get(id) else {
                continue;
            };
            if !obj.is_alive() {
                continue;
            }
            let closest = self.overlay.closest_to(obj.pos());
            if closest == self_id || !self.neighbors.contains_key(&closest) {
                continue;
            }
            self.relinquish(id, closest);
        }

        for record in self.store.overdue_transits(now) {
            self.store.end_transit(record.obj_id);
            if !self.store.contains(record.obj_id) {
                continue;
            }
            info!(
                "{} reclaims {} after {} did not acknowledge",
                self_id, record.obj_id, record.new_owner
            );
            self.send_claim(record.obj_id);
        }

        for id in self.store.tick_claims() {
            let still_orphan = self.store.get(id).is_some_and(|obj| {
                obj.is_alive() && self.overlay.closest_to(obj.pos()) == self_id
            }) && !self.store.is_owner(id);
            if still_orphan {
                info!("{} claims orphaned {}", self_id, id);
                self.send_claim(id);
            }
        }

        let candidates: Vec<ObjectId> = self
            .store
            .iter()
            .filter(|obj| obj.is_alive())
            .map(|obj| obj.id())
            .filter(|id| !self.store.is_owner(*id) && self.store.transit(*id).is_none())
            .filter(|id| !self.store.claim_pending(*id))
            .collect();
        for id in candidates {
            let in_region = self
                .store
                .get(id)
                .is_some_and(|obj| self.overlay.closest_to(obj.pos()) == self_id);
            if in_region {
                let jitter = 1 + self.ctx.random_below(self.config.countdown_takeover);
                debug!("{} may claim {} in {} ticks", self_id, id, jitter);
                self.store.start_claim(id, jitter);
            }
        }
    }

    fn send_claim(&mut self, id: ObjectId) {
        let claim = TransferMsg {
            obj_id: id,
            new_owner: self.id(),
            orig_owner: NodeId::UNASSIGNED,
        };
        self.send(self.id(), &claim, true);
    }

    /// Gives `id` to `new_owner` and tells the rest of the neighborhood.
    fn relinquish(&mut self, id: ObjectId, new_owner: NodeId) {
        let self_id = self.id();
        debug!("{} hands {} to {}", self_id, id, new_owner);

        let transfer = TransferMsg {
            obj_id: id,
            new_owner,
            orig_owner: self_id,
        }
        .to_bytes();

        self.introduce(new_owner, id);
        let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
        for neighbor in neighbors {
            self.send_bytes(neighbor, TransferMsg::TAG, &transfer, true);
        }

        self.store.set_owned(id, false);
        self.store.begin_transit(TransferRecord {
            obj_id: id,
            new_owner,
            old_owner: self_id,
            deadline: self.now() + self.config.countdown_takeover as u64,
        });
    }

    pub(crate) fn handle_transfer(&mut self, from: NodeId, msg: TransferMsg) {
        let self_id = self.id();
        let id = msg.obj_id;
        self.store.cancel_claim(id);

        if msg.new_owner == self_id {
            if !self.store.contains(id) {
                warn!("{} was given unknown object {} by {}", self_id, id, from);
                return;
            }
            let now = self.now();
            self.store.set_owned(id, true);
            self.store.end_transit(id);
            self.store.touch(id, now);

            if msg.orig_owner.is_assigned() && msg.orig_owner != self_id {
                self.send(msg.orig_owner, &TransferAckMsg { obj_id: id }, true);
            }

            let announce = (!msg.orig_owner.is_assigned()).then(|| msg.to_bytes());
            let others: Vec<NodeId> = self
                .neighbors
                .keys()
                .copied()
                .filter(|n| *n != msg.orig_owner && *n != from)
                .collect();
            for neighbor in others {
                self.introduce(neighbor, id);
                if let Some(bytes) = &announce {
                    self.send_bytes(neighbor, TransferMsg::TAG, bytes, true);
                }
            }
            debug!("{} now owns {}", self_id, id);
            return;
        }

        if self.store.is_owner(id) {
            debug!("{} yields {} to {}", self_id, id, msg.new_owner);
            self.store.set_owned(id, false);
            return;
        }

        if !self.neighbors.contains_key(&msg.new_owner) {
            if let Some(obj) = self.store.get_mut(id) {
                if obj.is_alive() {
                    debug!(
                        "{} drops {}: new owner {} is outside my neighborhood",
                        self_id, id, msg.new_owner
                    );
                    obj.mark_deleted();
                }
            }
        }
    }

    pub(crate) fn handle_transfer_ack(&mut self, from: NodeId, msg: TransferAckMsg) {
        match self.store.end_transit(msg.obj_id) {
            Some(record) => debug!("{} handover of {} acknowledged by {}", self.id(), record.obj_id, from),
            None => debug!("{} ignores stray TRANSFER_ACK for {}", self.id(), msg.obj_id),
        }
    }
}
