// SPDX-License-Identifier: GPL-3.0-or-later

//! `Group`/`Context` aggregate (§3).
//!
//! A `Context` owns every `Group` an embedder has created plus the
//! context-wide early-arrival registry; a `Group` owns everything scoped to
//! one communicator: its slot ring, resend list, plan cache and executor.
//! Both are generic over the collaborator pair (`T: Transport`,
//! `C: Completion`) the embedder supplies, rather than hardcoding a
//! transport.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    cache::{Fingerprint, PlanCache},
    collab::{Completion, ReqToken, Transport},
    config::Config,
    error::{Error, Result},
    executor::Executor,
    ids::{CollId, GroupId, MemberIndex},
    plan::Plan,
    resend::ResendList,
    slot::{Descriptor, SlotRing, UnexpectedRegistry, WireupMessage},
    topology,
};

/// Topology input as the embedder describes it (§3, `Topology Descriptor`):
/// either a single fixed distance (every peer equidistant, e.g. a flat
/// switch) or a full per-level placement list the topology builder
/// consumes directly.
#[derive(Debug, Clone)]
pub enum DistanceHint {
    Fixed(usize),
    PerLevel(Vec<topology::LevelPlacement>),
}

/// Everything scoped to one communicator.
pub struct Group<T: Transport, C: Completion> {
    pub id: GroupId,
    pub size: usize,
    pub my_index: MemberIndex,
    distance: DistanceHint,
    slots: SlotRing,
    resend: Arc<ResendList>,
    cache: Mutex<PlanCache<T::Endpoint>>,
    executor: Executor<T, C>,
    wireup_matched: Mutex<Vec<WireupMessage>>,
}

impl<T: Transport, C: Completion> std::fmt::Debug for Group<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("my_index", &self.my_index)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, C: Completion> Group<T, C> {
    fn new(
        id: GroupId,
        size: usize,
        my_index: MemberIndex,
        distance: DistanceHint,
        config: &Config,
        transport: Arc<T>,
        completion: Arc<C>,
    ) -> Result<Self> {
        if my_index >= size {
            return Err(Error::MemberOutOfRange {
                index: my_index,
                size,
            });
        }
        let resend = Arc::new(ResendList::new());
        Ok(Self {
            id,
            size,
            my_index,
            distance,
            slots: SlotRing::new(config.slot_count),
            resend: resend.clone(),
            cache: Mutex::new(PlanCache::new(config.plan_cache_limit)),
            executor: Executor::new(id, transport, completion, resend),
            wireup_matched: Mutex::new(Vec::new()),
        })
    }

    pub fn distance_hint(&self) -> &DistanceHint {
        &self.distance
    }

    pub fn cached_plan(&self, key: &Fingerprint) -> Option<Arc<Plan<T::Endpoint>>> {
        self.cache.lock().get(key)
    }

    pub fn cache_plan(&self, key: Fingerprint, plan: Arc<Plan<T::Endpoint>>, persistent: bool) {
        self.cache.lock().insert(key, plan, persistent);
    }

    pub fn trigger(
        &self,
        plan: Arc<Plan<T::Endpoint>>,
        coll_id: CollId,
        req: ReqToken,
        persistent: bool,
        recv_buffer: Option<crate::executor::RecvBuffer>,
    ) -> Result<()> {
        self.executor
            .trigger(&self.slots, plan, coll_id, req, persistent, recv_buffer)
    }

    pub fn tick(&self, coll_id: CollId) -> Result<()> {
        self.executor.tick(&self.slots, coll_id)
    }

    pub fn progress(&self) -> usize {
        self.executor.progress()
    }

    pub fn resend_list(&self) -> &ResendList {
        &self.resend
    }

    /// Route an arriving payload descriptor (§4.5): if it matches the
    /// slot's live expectation, dispatch it to the executor immediately,
    /// otherwise it has been buffered for a later `tick`.
    fn route(&self, desc: Descriptor) -> Result<()> {
        let coll_id = CollId(desc.header.coll_id as u32);
        match self.slots.get(coll_id).route(desc) {
            Some(matched) => self.executor.recv(&self.slots, coll_id, matched),
            None => Ok(()),
        }
    }

    fn absorb_wireup(&self, msg: WireupMessage) {
        self.wireup_matched.lock().push(msg);
    }

    /// Pull every wire-up message accumulated so far for this group, for
    /// the embedder's address-exchange protocol to consume.
    pub fn take_wireup(&self) -> Vec<WireupMessage> {
        std::mem::take(&mut *self.wireup_matched.lock())
    }
}

/// Owns every group in this process plus messages that arrived for a group
/// not yet created (§3, §4.5).
pub struct Context<T: Transport, C: Completion> {
    config: Arc<Config>,
    groups: Mutex<HashMap<GroupId, Arc<Group<T, C>>>>,
    unexpected: UnexpectedRegistry,
}

impl<T: Transport, C: Completion> Context<T, C> {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            groups: Mutex::new(HashMap::new()),
            unexpected: UnexpectedRegistry::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// §6 `group_create`: creates the group, then drains anything the
    /// context had parked for this id before it existed.
    pub fn create_group(
        &self,
        id: GroupId,
        size: usize,
        my_index: MemberIndex,
        distance: DistanceHint,
        transport: Arc<T>,
        completion: Arc<C>,
    ) -> Result<Arc<Group<T, C>>> {
        let mut groups = self.groups.lock();
        if groups.contains_key(&id) {
            return Err(Error::DuplicateGroup(id));
        }
        let group = Arc::new(Group::new(
            id, size, my_index, distance, &self.config, transport, completion,
        )?);

        let (payloads, wireup) = self.unexpected.drain(id);
        for desc in payloads {
            group.route(desc)?;
        }
        for msg in wireup {
            group.absorb_wireup(msg);
        }

        groups.insert(id, group.clone());
        Ok(group)
    }

    /// §6 `group_destroy`: refuses while the group has anything outstanding
    /// in its resend list (§7 `GroupBusy`), matching §4.6's "a group with a
    /// non-empty resend list cannot be torn down".
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(&id) {
            if !group.resend_list().is_empty() {
                tracing::warn!(group = %id, pending = group.resend_list().len(), "refusing to destroy group with operations still in flight");
                return Err(Error::GroupBusy);
            }
        }
        tracing::debug!(group = %id, "group destroyed");
        groups.remove(&id);
        Ok(())
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<Group<T, C>>> {
        self.groups.lock().get(&id).cloned()
    }

    /// Entry point for the embedder's receive path for ordinary payload
    /// messages (§4.5): routes to the live group if one exists, otherwise
    /// parks on the context-wide registry.
    pub fn route_incoming(&self, desc: Descriptor) -> Result<()> {
        let id = desc.header.group_id;
        match self.group(id) {
            Some(group) => group.route(desc),
            None => {
                self.unexpected.park_payload(id, desc);
                Ok(())
            }
        }
    }

    /// Entry point for the embedder's receive path for wire-up messages,
    /// which travel under a distinct active-message id (§4.5).
    pub fn route_wireup(&self, group_id: GroupId, msg: WireupMessage) {
        match self.group(group_id) {
            Some(group) => group.absorb_wireup(msg),
            None => self.unexpected.park_wireup(group_id, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{Address, ReqToken, SendOutcome};
    use crate::error::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct NullTransport;
    impl Transport for NullTransport {
        type Endpoint = usize;
        type Error = std::convert::Infallible;
        fn connect(&self, _addr: &Address) -> std::result::Result<usize, Self::Error> {
            Ok(0)
        }
        fn send(&self, _ep: &usize, _payload: &[u8]) -> std::result::Result<SendOutcome, Self::Error> {
            Ok(SendOutcome::Sent)
        }
        fn progress(&self) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct CountingCompletion(AtomicUsize);
    impl Completion for CountingCompletion {
        fn complete(&self, _req: ReqToken, _status: Status) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ctx() -> Context<NullTransport, CountingCompletion> {
        Context::new(Config::default()).unwrap()
    }

    #[test]
    fn duplicate_group_create_is_rejected() {
        let context = ctx();
        let id = GroupId::new(1).unwrap();
        context
            .create_group(
                id,
                4,
                0,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap();
        let err = context
            .create_group(
                id,
                4,
                0,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateGroup(_)));
    }

    #[test]
    fn early_arrival_before_group_creation_is_delivered_on_creation() {
        let context = ctx();
        let id = GroupId::new(2).unwrap();
        context.route_wireup(
            id,
            WireupMessage {
                peer: 1,
                payload: vec![7],
            },
        );
        let group = context
            .create_group(
                id,
                2,
                0,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap();
        let pending = group.take_wireup();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].peer, 1);
    }

    #[test]
    fn destroy_refuses_a_group_with_pending_resends() {
        let context = ctx();
        let id = GroupId::new(3).unwrap();
        let group = context
            .create_group(
                id,
                2,
                0,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap();
        group.resend_list().schedule(
            1,
            crate::resend::PendingSend {
                coll_id: CollId(1),
                dest: 1,
                attempt: 0,
            },
        );
        assert!(matches!(
            context.destroy_group(id).unwrap_err(),
            Error::GroupBusy
        ));
    }

    #[test]
    fn destroy_succeeds_once_resend_list_drains() {
        let context = ctx();
        let id = GroupId::new(4).unwrap();
        let group = context
            .create_group(
                id,
                2,
                0,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap();
        let handle = group.resend_list().schedule(
            1,
            crate::resend::PendingSend {
                coll_id: CollId(1),
                dest: 1,
                attempt: 0,
            },
        );
        group.resend_list().cancel(handle);
        assert!(context.destroy_group(id).is_ok());
    }

    #[test]
    fn member_out_of_range_is_rejected_at_creation() {
        let context = ctx();
        let err = context
            .create_group(
                GroupId::new(9).unwrap(),
                4,
                4,
                DistanceHint::Fixed(1),
                Arc::new(NullTransport),
                Arc::new(CountingCompletion::default()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MemberOutOfRange { .. }));
    }
}
