// SPDX-License-Identifier: GPL-3.0-or-later

//! RX Slot Ring and Early-Arrival Queue (§4.5).
//!
//! A fixed, power-of-two number of concurrent-operation slots per group;
//! each slot holds one in-flight operation's expected `local_id` and a ring
//! of messages whose step has not been reached yet locally. Messages that
//! arrive before any group with the matching id exists are parked on a
//! context-wide [`UnexpectedRegistry`] keyed by group id.
//!
//! §5 "Fences": a store fence precedes publishing a slot's
//! `expected.local_id` when starting an operation, and the RX path issues a
//! load fence before consuming payloads it matched without the lock. This
//! module is where those fences live; nothing above it needs to know they
//! exist.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use crate::{
    ids::{CollId, GroupId, MemberIndex},
    wire::{Header, LocalId},
};

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Descriptor {
    pub fn local_id(&self) -> LocalId {
        self.header.local_id()
    }
}

/// One cell of the ring (§3, `Slot`). `expected` is `0` ("free") until an
/// operation is started for the collective id that maps to this slot
/// (I11), and is cleared back to `0` on completion.
pub struct Slot {
    expected: AtomicU16,
    buffered: Mutex<VecDeque<Descriptor>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            expected: AtomicU16::new(LocalId::FREE.raw()),
            buffered: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_free(&self) -> bool {
        self.expected.load(Ordering::Acquire) == LocalId::FREE.raw()
    }

    pub fn expected_local_id(&self) -> LocalId {
        LocalId::pack(
            (self.expected.load(Ordering::Acquire) >> 8) as u8,
            (self.expected.load(Ordering::Acquire) & 0xff) as u8,
        )
    }

    /// Publish this slot as owned by the operation expecting `local_id`.
    /// Must be called only while [`Slot::is_free`]; the store is a release
    /// so the RX path's acquire load in [`Slot::expected_local_id`] always
    /// observes a fully-initialized operation before it starts matching
    /// messages against it.
    pub fn occupy(&self, local_id: LocalId) {
        debug_assert!(!local_id.is_free(), "cannot occupy a slot with the free id");
        self.expected.store(local_id.raw(), Ordering::Release);
    }

    /// Free the slot (§4.4 `finish`). Buffered messages for the *next*
    /// operation that maps here are left in place, per (I11)/(§3 Operation
    /// lifetime note).
    pub fn free(&self) {
        self.expected.store(LocalId::FREE.raw(), Ordering::Release);
    }

    /// Route an arriving descriptor: if it matches the slot's current
    /// expectation, return it directly for immediate `recv` (the executor
    /// decides whether that is safe re: re-entrancy); otherwise buffer it
    /// for a later `tick` to drain (§4.4 step 2, §4.5).
    pub fn route(&self, desc: Descriptor) -> Option<Descriptor> {
        if !self.is_free() && desc.local_id() == self.expected_local_id() {
            Some(desc)
        } else {
            self.buffered.lock().push_back(desc);
            None
        }
    }

    /// Pop every buffered message matching the slot's current expectation,
    /// in arrival order (§4.4 step 2: "for each message whose `local_id`
    /// matches... remove it from the array").
    pub fn drain_matching(&self) -> Vec<Descriptor> {
        let expected = self.expected_local_id();
        if expected.is_free() {
            return Vec::new();
        }
        let mut buffered = self.buffered.lock();
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            buffered.drain(..).partition(|d| d.local_id() == expected);
        *buffered = rest;
        matching.into_iter().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.buffered.lock().len()
    }
}

/// Per-group ring of [`Slot`]s, indexed `coll_id mod S` (I11).
pub struct SlotRing {
    slots: Vec<Slot>,
}

impl SlotRing {
    pub fn new(count: usize) -> Self {
        assert!(
            count.is_power_of_two() && (8..=64).contains(&count),
            "slot count must be a power of two in [8, 64]"
        );
        Self {
            slots: (0..count).map(|_| Slot::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, coll_id: CollId) -> &Slot {
        &self.slots[coll_id.slot(self.slots.len())]
    }

    /// §3 invariant 3: no two concurrent in-flight operations in the same
    /// group occupy the same slot.
    pub fn all_free(&self) -> bool {
        self.slots.iter().all(Slot::is_free)
    }
}

/// A wire-up (address-exchange) message, routed separately from payload
/// descriptors via its own active-message id (§4.5).
#[derive(Debug, Clone)]
pub struct WireupMessage {
    pub peer: MemberIndex,
    pub payload: Vec<u8>,
}

/// Context-wide park for messages that arrive before the target group
/// exists: a locked map keyed by group id, for both payload descriptors and
/// wire-up messages (§3, §4.5).
#[derive(Default)]
pub struct UnexpectedRegistry {
    payloads: Mutex<HashMap<GroupId, Vec<Descriptor>>>,
    wireup: Mutex<HashMap<GroupId, Vec<WireupMessage>>>,
}

impl UnexpectedRegistry {
    pub fn park_payload(&self, group: GroupId, desc: Descriptor) {
        self.payloads.lock().entry(group).or_default().push(desc);
    }

    pub fn park_wireup(&self, group: GroupId, msg: WireupMessage) {
        self.wireup.lock().entry(group).or_default().push(msg);
    }

    /// Drain everything parked for `group` (called once, at group
    /// creation, per §4.5: "when a group with that id is later created,
    /// drain the queue into the matching slot rings").
    pub fn drain(&self, group: GroupId) -> (Vec<Descriptor>, Vec<WireupMessage>) {
        let payloads = self.payloads.lock().remove(&group).unwrap_or_default();
        let wireup = self.wireup.lock().remove(&group).unwrap_or_default();
        (payloads, wireup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GroupId;

    fn desc(group: u32, coll: u8, step: u8) -> Descriptor {
        Descriptor {
            header: Header {
                remote_offset: 0,
                group_id: GroupId::new(group).unwrap(),
                coll_id: coll,
                step_idx: step,
            },
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn fresh_slot_is_free() {
        let ring = SlotRing::new(8);
        assert!(ring.all_free());
    }

    #[test]
    fn slot_index_is_coll_id_mod_count() {
        let ring = SlotRing::new(8);
        let a = ring.get(CollId(3));
        let b = ring.get(CollId(11));
        a.occupy(LocalId::pack(1, 3));
        assert!(!b.is_free(), "11 mod 8 == 3, same slot as coll_id 3");
    }

    #[test]
    fn message_matching_expectation_routes_directly() {
        let ring = SlotRing::new(8);
        let slot = ring.get(CollId(1));
        slot.occupy(LocalId::pack(1, 1));
        let routed = slot.route(desc(5, 1, 1));
        assert!(routed.is_some());
        assert_eq!(slot.pending_count(), 0);
    }

    #[test]
    fn early_message_is_buffered_then_drained_on_match() {
        let ring = SlotRing::new(8);
        let slot = ring.get(CollId(7));
        // Message for step 1 arrives before the operation (expecting step
        // 1) is started.
        assert!(slot.route(desc(1, 7, 1)).is_none());
        assert_eq!(slot.pending_count(), 1);
        slot.occupy(LocalId::pack(1, 7));
        let drained = slot.drain_matching();
        assert_eq!(drained.len(), 1);
        assert_eq!(slot.pending_count(), 0);
    }

    #[test]
    fn unexpected_registry_parks_and_drains_per_group() {
        let reg = UnexpectedRegistry::default();
        let g = GroupId::new(3).unwrap();
        reg.park_payload(g, desc(3, 0, 1));
        reg.park_wireup(
            g,
            WireupMessage {
                peer: 2,
                payload: vec![9],
            },
        );
        let (payloads, wireup) = reg.drain(g);
        assert_eq!(payloads.len(), 1);
        assert_eq!(wireup.len(), 1);
        let (payloads2, wireup2) = reg.drain(g);
        assert!(payloads2.is_empty() && wireup2.is_empty());
    }
}
