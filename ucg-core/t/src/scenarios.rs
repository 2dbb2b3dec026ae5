// SPDX-License-Identifier: GPL-3.0-or-later

//! Scenarios S1-S6 and a handful of the data-model invariants (§8), driven
//! only through the public surface in `ucg_core::lib`.

use std::sync::Arc;

use ucg_core::collab::{Datatype, ReqToken};
use ucg_core::config::Config;
use ucg_core::error::{Error, Status};
use ucg_core::ids::{CollId, GroupId};
use ucg_core::Fingerprint;
use ucg_core::plan::{CollectiveKind, CollectiveParams, Modifiers, TransportLimits};
use ucg_core::slot::{Descriptor, WireupMessage};
use ucg_core::topology::{build, BuildParams, Direction, LevelPlacement, PatternKind};
use ucg_core::wire::Header;
use ucg_core::{collective_create, collective_start, Context, DistanceHint};

use crate::support::{FlatAddressBook, IdentityResolver, Loopback, RecordingCompletion, U32Ops};

fn limits() -> TransportLimits {
    TransportLimits {
        max_short: 64,
        max_bcopy: 4096,
        zcopy_threshold: 8192,
        max_zcopy: 1 << 20,
    }
}

fn barrier_params() -> CollectiveParams {
    CollectiveParams {
        kind: CollectiveKind::Barrier,
        root: Some(0),
        send_dt: Datatype(0),
        recv_dt: Datatype(0),
        count: 0,
        op: None,
        modifiers: Modifiers::default(),
    }
}

fn tree_steps(me: usize, n: usize, radix: usize) -> Vec<ucg_core::topology::Step> {
    build(
        &BuildParams {
            me,
            group_size: n,
            root: Some(0),
            levels: vec![LevelPlacement {
                first: 0,
                stride: 1,
                count: n,
                pattern: PatternKind::KaryTree,
                radix_or_factor: radix,
                tx_msg_size: 0,
                rx_msg_size: 0,
                inter_host: false,
            }],
            direction: Direction::Full,
            multiroot_thresh: 0,
        },
        None,
    )
    .unwrap()
}

fn new_ctx() -> Context<Loopback, RecordingCompletion> {
    Context::new(Config::default()).unwrap()
}

/// S1: a barrier over a k-ary radix-2 tree of 4 members. The root's first
/// phase must send to both children and expect a message from each before it
/// steps to the fan-out phase; a leaf sends to its parent then waits on the
/// reply.
#[test]
fn s1_barrier_root_fans_in_then_out() {
    let ctx = new_ctx();
    let group_id = GroupId::new(1).unwrap();
    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    let group = ctx
        .group_create(group_id, 4, 0, DistanceHint::Fixed(1), transport.clone(), completion.clone())
        .unwrap();

    let steps = tree_steps(0, 4, 2);
    let dt = Arc::new(U32Ops::default());
    let mut resolver = IdentityResolver;
    let plan = collective_create(
        &ctx,
        group_id,
        &steps,
        &barrier_params(),
        Fingerprint([0u8; 64]),
        false,
        &limits(),
        &mut resolver,
        dt.as_ref(),
        dt.clone(),
    )
    .unwrap();
    assert!(plan.flags.barrier);

    let coll_id = CollId(1);
    collective_start(&ctx, group_id, plan, coll_id, ReqToken(7), false, None).unwrap();
    assert!(transport.sent_to().is_empty(), "root's first phase only receives, it fans out after");

    for _ in 0..2 {
        let desc = Descriptor {
            header: Header {
                remote_offset: 0,
                group_id,
                coll_id: coll_id.wire_byte(),
                step_idx: 1,
            },
            payload: vec![],
        };
        ctx.route_incoming(desc).unwrap();
    }
    assert_eq!(transport.sent_to(), vec![1, 2], "root fans back out once both children report in");
    assert_eq!(completion.count(), 1, "root completes as soon as it has answered both children");
    assert_eq!(completion.statuses(), vec![Status::Ok]);
    let _ = group;
}

/// S1, leaf side: rank 3 sends to its parent (rank 1) and only completes
/// once the parent answers.
#[test]
fn s1_barrier_leaf_waits_for_parent_reply() {
    let ctx = new_ctx();
    let group_id = GroupId::new(2).unwrap();
    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    ctx.group_create(group_id, 4, 3, DistanceHint::Fixed(1), transport.clone(), completion.clone())
        .unwrap();

    let steps = tree_steps(3, 4, 2);
    let dt = Arc::new(U32Ops::default());
    let mut resolver = IdentityResolver;
    let plan = collective_create(
        &ctx,
        group_id,
        &steps,
        &barrier_params(),
        Fingerprint([1u8; 64]),
        false,
        &limits(),
        &mut resolver,
        dt.as_ref(),
        dt.clone(),
    )
    .unwrap();

    let coll_id = CollId(2);
    collective_start(&ctx, group_id, plan, coll_id, ReqToken(1), false, None).unwrap();
    assert_eq!(transport.sent_to(), vec![1], "leaf only sends up to its parent");
    assert_eq!(completion.count(), 0, "not done until the parent answers");

    let desc = Descriptor {
        header: Header {
            remote_offset: 0,
            group_id,
            coll_id: coll_id.wire_byte(),
            step_idx: 1,
        },
        payload: vec![],
    };
    ctx.route_incoming(desc).unwrap();
    assert_eq!(completion.count(), 1);
}

/// S4 (plan cache): a second `collective_create` with the same fingerprint
/// and a non-volatile config returns the identical cached `Arc`, not a fresh
/// lowering.
#[test]
fn s4_repeated_create_with_same_fingerprint_hits_the_cache() {
    let ctx = new_ctx();
    let group_id = GroupId::new(3).unwrap();
    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    ctx.group_create(group_id, 4, 0, DistanceHint::Fixed(1), transport, completion).unwrap();

    let steps = tree_steps(0, 4, 2);
    let dt = Arc::new(U32Ops::default());
    let fp = Fingerprint([9u8; 64]);
    let plan_a = collective_create(
        &ctx, group_id, &steps, &barrier_params(), fp, true, &limits(),
        &mut IdentityResolver, dt.as_ref(), dt.clone(),
    )
    .unwrap();
    let plan_b = collective_create(
        &ctx, group_id, &steps, &barrier_params(), fp, true, &limits(),
        &mut IdentityResolver, dt.as_ref(), dt.clone(),
    )
    .unwrap();
    assert!(Arc::ptr_eq(&plan_a, &plan_b), "same fingerprint must hit the cache");
}

/// S5 (early arrival): a wire-up message for a group that does not exist yet
/// is parked on the context and delivered once the group is created (§4.5).
#[test]
fn s5_wireup_before_group_creation_is_delivered_on_creation() {
    let ctx = new_ctx();
    let group_id = GroupId::new(4).unwrap();
    ctx.route_wireup(group_id, WireupMessage { peer: 2, payload: vec![5, 6] });

    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    let group = ctx
        .group_create(group_id, 4, 0, DistanceHint::Fixed(1), transport, completion)
        .unwrap();

    let pending = group.take_wireup();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].peer, 2);
}

/// S6 (resend): when the transport stalls a send, it lands on the group's
/// resend list instead of being lost, and a subsequent sweep hands it back
/// for a retry.
#[test]
fn s6_stalled_send_is_recorded_on_the_resend_list() {
    let ctx = new_ctx();
    let group_id = GroupId::new(5).unwrap();
    // Rank 3 is a leaf: its first phase sends one message, to its parent,
    // with no rx -- the only phase in this topology guaranteed to send
    // without first waiting on an incoming message.
    let transport = Arc::new(Loopback::stalling_first(1));
    let completion = Arc::new(RecordingCompletion::default());
    let group = ctx
        .group_create(group_id, 4, 3, DistanceHint::Fixed(1), transport, completion)
        .unwrap();

    let steps = tree_steps(3, 4, 2);
    let dt = Arc::new(U32Ops::default());
    let plan = collective_create(
        &ctx, group_id, &steps, &barrier_params(), Fingerprint([2u8; 64]), false, &limits(),
        &mut IdentityResolver, dt.as_ref(), dt.clone(),
    )
    .unwrap();

    collective_start(&ctx, group_id, plan, CollId(3), ReqToken(1), false, None).unwrap();
    assert_eq!(group.resend_list().len(), 1, "the leaf's only send stalled");

    let due = group.resend_list().sweep(1);
    assert_eq!(due.len(), 1);
    assert!(group.resend_list().is_empty());
}

/// (I11) a slot is reused across back-to-back operations on the same
/// `coll_id`: triggering a second barrier only succeeds after the first has
/// completed and freed its slot.
#[test]
fn slot_is_reusable_once_the_prior_operation_completes() {
    let ctx = new_ctx();
    let group_id = GroupId::new(6).unwrap();
    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    ctx.group_create(group_id, 4, 0, DistanceHint::Fixed(1), transport.clone(), completion.clone())
        .unwrap();

    let steps = tree_steps(0, 4, 2);
    let dt = Arc::new(U32Ops::default());
    let coll_id = CollId(4);

    let plan = collective_create(
        &ctx, group_id, &steps, &barrier_params(), Fingerprint([3u8; 64]), false, &limits(),
        &mut IdentityResolver, dt.as_ref(), dt.clone(),
    )
    .unwrap();
    collective_start(&ctx, group_id, plan.clone(), coll_id, ReqToken(10), false, None).unwrap();
    for _ in 0..2 {
        ctx.route_incoming(Descriptor {
            header: Header { remote_offset: 0, group_id, coll_id: coll_id.wire_byte(), step_idx: 1 },
            payload: vec![],
        })
        .unwrap();
    }
    assert_eq!(completion.count(), 1);

    // Same coll_id, brand-new operation: must be accepted now that the slot
    // freed on completion.
    collective_start(&ctx, group_id, plan, coll_id, ReqToken(11), false, None).unwrap();
    for _ in 0..2 {
        ctx.route_incoming(Descriptor {
            header: Header { remote_offset: 0, group_id, coll_id: coll_id.wire_byte(), step_idx: 1 },
            payload: vec![],
        })
        .unwrap();
    }
    assert_eq!(completion.count(), 2);
}

/// (I1/§7) group ids are validated at creation; a duplicate is rejected with
/// the fixed `Status::InvalidParam` narrowing.
#[test]
fn duplicate_group_id_narrows_to_invalid_param_status() {
    let ctx = new_ctx();
    let group_id = GroupId::new(7).unwrap();
    let transport = Arc::new(Loopback::default());
    let completion = Arc::new(RecordingCompletion::default());
    ctx.group_create(group_id, 2, 0, DistanceHint::Fixed(1), transport.clone(), completion.clone())
        .unwrap();
    let err = ctx
        .group_create(group_id, 2, 0, DistanceHint::Fixed(1), transport, completion)
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateGroup(_)));
    assert_eq!(err.status(), Status::InvalidParam);
}

/// `FlatAddressBook`/`AddressResolver` resolve and cache a lookup per peer
/// (§4.2 step 1, (I3)) independent of any particular transport.
#[test]
fn address_resolver_caches_repeated_lookups_for_the_same_peer() {
    use ucg_core::plan::{AddressResolver, EndpointResolver};
    let book = FlatAddressBook;
    let mut resolver = AddressResolver::new(&book);
    let a = resolver.resolve(2).unwrap();
    let b = resolver.resolve(2).unwrap();
    assert_eq!(a.0, vec![2]);
    assert_eq!(a.0, b.0);
}
