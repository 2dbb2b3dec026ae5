// SPDX-License-Identifier: GPL-3.0-or-later

//! Group collective-communication planner and execution engine.
//!
//! This crate builds topology descriptors, lowers them into cached
//! execution plans, and drives those plans to completion against a
//! transport/completion pair the embedder supplies. It does not implement a
//! transport, memory registration, or a CLI -- those are external
//! collaborators reached through the traits in [`collab`].
//!
//! The top-level functions here (`collective_create`, `collective_start`,
//! `collective_check_status`, `collective_destroy`) and the [`Context`]
//! methods (`group_create`/`group_destroy`/`group_query`) together form the
//! public surface; everything below them is reachable for embedders that
//! want to drive the planner and executor directly instead.

pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod executor;
pub mod group;
pub mod ids;
pub mod plan;
pub mod resend;
pub mod slot;
pub mod topology;
pub mod wire;

pub use cache::Fingerprint;
pub use collab::{Completion, ReqToken, Transport};
pub use config::Config;
pub use error::{Error, Result, Status};
pub use executor::RecvBuffer;
pub use group::{Context, DistanceHint, Group};
pub use ids::{CollId, GroupId, MemberIndex, StepIdx};
pub use plan::{CollectiveKind, CollectiveParams, Plan};

use std::sync::Arc;

use collab::{DatatypeOps, ReduceOps};
use plan::{EndpointResolver, TransportLimits};
use topology::Step;

/// §6 `collective_is_supported`: whether this crate's lowerer has a code
/// path for `kind` at all. Every [`CollectiveKind`] variant this crate
/// defines is lowerable; the forms the distilled spec's Non-goals exclude
/// (neighborhood alltoall-v/w, non-commutative reductions) simply have no
/// corresponding variant or operator, so there is nothing further to check
/// here.
pub fn collective_is_supported(_kind: CollectiveKind) -> bool {
    true
}

/// §6 `collective_create`: look up a cached plan by fingerprint, or lower a
/// fresh one from `steps` and cache it. When [`Config::volatile_datatypes`]
/// is set, re-validates the datatype via `dtops` even on a cache hit
/// (§10.6).
#[tracing::instrument(skip(context, steps, limits, resolver, dtops, reduce))]
pub fn collective_create<T, C, R>(
    context: &Context<T, C>,
    group_id: GroupId,
    steps: &[Step],
    params: &CollectiveParams,
    fingerprint: Fingerprint,
    persistent: bool,
    limits: &TransportLimits,
    resolver: &mut R,
    dtops: &dyn DatatypeOps,
    reduce: Arc<dyn ReduceOps>,
) -> Result<Arc<Plan<T::Endpoint>>>
where
    T: Transport<Endpoint = R::Endpoint>,
    C: Completion,
    R: EndpointResolver,
{
    let group = context
        .group(group_id)
        .ok_or_else(|| Error::InvalidParam(format!("no such group: {group_id}")))?;

    if !context.config().volatile_datatypes {
        if let Some(cached) = group.cached_plan(&fingerprint) {
            if dtops.is_integer(params.recv_dt).is_none() && !dtops.is_float(params.recv_dt) {
                return Err(Error::DatatypeUnsupported);
            }
            return Ok(cached);
        }
    }

    let plan = Arc::new(plan::lower(
        steps,
        group.my_index,
        params,
        limits,
        resolver,
        dtops,
        reduce,
    )?);
    group.cache_plan(fingerprint, plan.clone(), persistent);
    Ok(plan)
}

/// §6 `collective_start`: allocate a slot in the group's ring and run the
/// plan's first phase. `recv_buffer` is the embedder's receive buffer for
/// this operation (`None` for a collective with no data to write, such as a
/// barrier); `recv` writes or reduces into it directly, so the embedder can
/// read the result through the same handle once its [`Completion`] callback
/// fires.
#[tracing::instrument(skip(context, plan, recv_buffer))]
pub fn collective_start<T, C>(
    context: &Context<T, C>,
    group_id: GroupId,
    plan: Arc<Plan<T::Endpoint>>,
    coll_id: CollId,
    req: ReqToken,
    persistent: bool,
    recv_buffer: Option<executor::RecvBuffer>,
) -> Result<()>
where
    T: Transport,
    C: Completion,
{
    let group = context
        .group(group_id)
        .ok_or_else(|| Error::InvalidParam(format!("no such group: {group_id}")))?;
    group.trigger(plan, coll_id, req, persistent, recv_buffer)
}

/// §6 `progress`/`collective_check_status`: drive the transport once and
/// report how many completions it processed. A non-zero return does not by
/// itself mean `req`'s operation completed -- the embedder learns that
/// through its [`Completion`] callback.
pub fn collective_check_status<T, C>(context: &Context<T, C>, group_id: GroupId) -> Result<usize>
where
    T: Transport,
    C: Completion,
{
    let group = context
        .group(group_id)
        .ok_or_else(|| Error::InvalidParam(format!("no such group: {group_id}")))?;
    Ok(group.progress())
}

/// §6 `collective_destroy`/cancellation. Best-effort cancellation of an
/// in-flight collective is explicitly out of scope (§1 Non-goals); an
/// operation runs to completion once triggered.
pub fn collective_destroy(_req: ReqToken) -> Result<()> {
    Err(Error::NotImplemented)
}

/// Snapshot returned by [`Context::group_query`].
#[derive(Debug, Clone, Copy)]
pub struct GroupInfo {
    pub size: usize,
    pub my_index: MemberIndex,
}

impl<T: Transport, C: Completion> Context<T, C> {
    /// §6 `group_create`.
    pub fn group_create(
        &self,
        id: GroupId,
        size: usize,
        my_index: MemberIndex,
        distance: DistanceHint,
        transport: Arc<T>,
        completion: Arc<C>,
    ) -> Result<Arc<Group<T, C>>> {
        self.create_group(id, size, my_index, distance, transport, completion)
    }

    /// §6 `group_destroy`.
    pub fn group_destroy(&self, id: GroupId) -> Result<()> {
        self.destroy_group(id)
    }

    /// §6 `group_query`.
    pub fn group_query(&self, id: GroupId) -> Option<GroupInfo> {
        self.group(id).map(|g| GroupInfo {
            size: g.size,
            my_index: g.my_index,
        })
    }
}
