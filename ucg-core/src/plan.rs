// SPDX-License-Identifier: GPL-3.0-or-later

//! Plan Lowerer (§4.2) and the `Plan`/`Phase` types it produces (§3).
//!
//! DESIGN NOTES §9 calls for the dispatch-on-packed-flags of the original
//! to become "an explicit tagged-variant dispatch... ideally materialized
//! as a per-phase function pointer chosen at plan time so the hot path is a
//! single indirect call." [`CompAgg::apply`] is exactly that: the lowerer
//! decides once, at plan time, which of the six completion behaviours a
//! phase uses, and the executor's hot loop just calls it.

use std::sync::Arc;

use crate::{
    collab::{AddressBook, Datatype, DatatypeOps, ReduceOp, ReduceOps},
    error::{Error, Result},
    ids::StepIdx,
    topology::{self, Step},
};

/// Which collective primitive is being planned. Variadic (`-v`) forms are
/// represented by `count`/per-peer length tables the caller supplies
/// alongside `CollectiveParams`, not by extra enum variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    Barrier,
    Bcast,
    Reduce,
    Allreduce,
    Allgather,
    Alltoall,
    Scan,
    Scatter,
    Gather,
}

/// The bits of `modifiers` this crate interprets directly; everything else
/// is opaque and only used for the cache fingerprint (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers(pub u32);

impl Modifiers {
    pub const PERSISTENT: u32 = 1 << 0;
    pub const CONCATENATE: u32 = 1 << 1;

    pub fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT != 0
    }

    pub fn concatenate(self) -> bool {
        self.0 & Self::CONCATENATE != 0
    }
}

#[derive(Debug, Clone)]
pub struct CollectiveParams {
    pub kind: CollectiveKind,
    pub root: Option<usize>,
    pub send_dt: Datatype,
    pub recv_dt: Datatype,
    pub count: usize,
    pub op: Option<ReduceOp>,
    pub modifiers: Modifiers,
}

/// Transport capability table the lowerer consults to pick a send method
/// (§4.2 step 2). Excludes header overhead, per spec.
#[derive(Debug, Clone, Copy)]
pub struct TransportLimits {
    pub max_short: usize,
    pub max_bcopy: usize,
    pub zcopy_threshold: usize,
    pub max_zcopy: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMethod {
    Short,
    Bcopy,
    Zcopy,
    /// Zero-length payload (barrier-style phases): no buffer is touched.
    Mock,
}

/// §4.2 step 2: pick a send method and whether the phase is fragmented.
pub fn choose_send_method(length: usize, limits: &TransportLimits) -> (SendMethod, bool) {
    if length == 0 {
        return (SendMethod::Mock, false);
    }
    if length <= limits.max_short {
        (SendMethod::Short, false)
    } else if length <= limits.max_bcopy {
        (SendMethod::Bcopy, false)
    } else if length > limits.zcopy_threshold && length <= limits.max_zcopy {
        (SendMethod::Zcopy, false)
    } else if length <= limits.max_bcopy.max(limits.max_zcopy) {
        if length <= limits.max_zcopy {
            (SendMethod::Zcopy, false)
        } else {
            tracing::warn!(length, max_zcopy = limits.max_zcopy, "message exceeds zcopy cap, falling back to bcopy");
            (SendMethod::Bcopy, false)
        }
    } else {
        // Too large for a single fragment of any method: fragment at the
        // largest available cap, rounded down to a multiple of the
        // datatype's element size by the caller (§4.2: "frag_len = max -
        // (max mod dt_size)").
        (SendMethod::Zcopy, true)
    }
}

/// `frag_len = max - (max mod dt_size)` (§4.2 step 2, (I9)).
pub fn fragment_length(max: usize, dt_size: usize) -> usize {
    if dt_size == 0 {
        return max;
    }
    max - (max % dt_size)
}

/// §4.2 step 5, `comp_agg` table: which action `recv` takes when a message
/// for this phase arrives. This is the "per-phase function pointer chosen
/// at plan time" DESIGN NOTES §9 asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompAgg {
    Nop,
    RemoteKey,
    ReduceInternal,
    ReduceExternal,
    Pipeline,
    WriteNoOffset,
    WriteWithOffset,
}

impl CompAgg {
    /// §4.2 step 5 selection table.
    pub fn select(
        barrier: bool,
        frag_count: usize,
        from_every_peer: bool,
        op: Option<ReduceOp>,
        reduce_kind: Option<crate::collab::ReduceKind>,
        pipelined: bool,
        method: SendMethod,
        concatenate: bool,
    ) -> Self {
        if barrier || frag_count == 0 {
            return CompAgg::Nop;
        }
        if matches!(method, SendMethod::Zcopy) {
            return CompAgg::RemoteKey;
        }
        if from_every_peer && op.is_some() {
            return match reduce_kind {
                Some(crate::collab::ReduceKind::Sum) => CompAgg::ReduceInternal,
                _ => CompAgg::ReduceExternal,
            };
        }
        if pipelined {
            return CompAgg::Pipeline;
        }
        if frag_count == 1 && !concatenate {
            CompAgg::WriteNoOffset
        } else {
            CompAgg::WriteWithOffset
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompCriteria {
    SingleMessage,
    MultipleMessages,
    MultipleMessagesZcopy,
}

impl CompCriteria {
    pub fn select(frag_count: usize, fragmented: bool, method: SendMethod) -> Self {
        if frag_count == 1 && !fragmented {
            CompCriteria::SingleMessage
        } else if matches!(method, SendMethod::Zcopy) {
            CompCriteria::MultipleMessagesZcopy
        } else {
            CompCriteria::MultipleMessages
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompAction {
    pub step: bool,
    pub op: bool,
    pub send: bool,
}

/// Elementwise little-endian unsigned-integer sum, the only built-in
/// reduction this crate implements (§1: non-commutative/external-only
/// operators are reached through [`Reducer::External`] instead).
pub type BuiltinReduceFn = fn(dst: &mut [u8], src: &[u8], elem_size: usize);

pub fn sum_le_bytes(dst: &mut [u8], src: &[u8], elem_size: usize) {
    let n = dst.len().min(src.len());
    match elem_size {
        4 => {
            for (d, s) in dst[..n].chunks_exact_mut(4).zip(src[..n].chunks_exact(4)) {
                let a = u32::from_le_bytes(d.try_into().unwrap());
                let b = u32::from_le_bytes(s.try_into().unwrap());
                d.copy_from_slice(&a.wrapping_add(b).to_le_bytes());
            }
        }
        8 => {
            for (d, s) in dst[..n].chunks_exact_mut(8).zip(src[..n].chunks_exact(8)) {
                let a = u64::from_le_bytes(d.try_into().unwrap());
                let b = u64::from_le_bytes(s.try_into().unwrap());
                d.copy_from_slice(&a.wrapping_add(b).to_le_bytes());
            }
        }
        _ => {
            for (d, s) in dst[..n].iter_mut().zip(src[..n].iter()) {
                *d = d.wrapping_add(*s);
            }
        }
    }
}

/// `phase.rx.reduce_f` (§4.4 recv, `REDUCE_INTERNAL`/`REDUCE_EXTERNAL`):
/// chosen once at plan time so `recv` never re-derives which reducer a
/// phase needs.
#[derive(Clone)]
pub enum Reducer {
    Internal(BuiltinReduceFn),
    External {
        reduce: Arc<dyn ReduceOps>,
        op: ReduceOp,
        dt: Datatype,
    },
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reducer::Internal(_) => f.write_str("Reducer::Internal"),
            Reducer::External { op, dt, .. } => {
                f.debug_struct("Reducer::External").field("op", op).field("dt", dt).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RxPhase {
    pub step_idx: StepIdx,
    pub peers: Vec<usize>,
    pub batch_len: usize,
    pub frags_cnt: usize,
    pub comp_agg: CompAgg,
    pub comp_criteria: CompCriteria,
    pub comp_action: CompAction,
    /// Element width of the receive datatype, for reducers that operate on
    /// fixed-width elements rather than raw bytes.
    pub elem_size: usize,
    pub reducer: Option<Reducer>,
}

#[derive(Debug, Clone)]
pub struct TxPhase<Ep> {
    pub step_idx: StepIdx,
    pub single_ep: Option<Ep>,
    pub multi_eps: Vec<Ep>,
    pub length: usize,
    pub frag_len: usize,
    pub method: SendMethod,
    pub root: bool,
}

impl<Ep> TxPhase<Ep> {
    pub fn ep_count(&self) -> usize {
        if self.single_ep.is_some() {
            1
        } else {
            self.multi_eps.len()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseFlags {
    pub fragmented: bool,
    pub pipelined: bool,
    pub last_step: bool,
    pub expects_rx: bool,
}

#[derive(Debug, Clone)]
pub struct Phase<Ep> {
    pub flags: PhaseFlags,
    pub rx: Option<RxPhase>,
    pub tx: Option<TxPhase<Ep>>,
}

impl<Ep> Phase<Ep> {
    /// (I8): a single endpoint uses `single_ep`, more than one uses
    /// `multi_eps`.
    pub fn check_invariants(&self) {
        if let Some(tx) = &self.tx {
            debug_assert!(
                (tx.single_ep.is_some()) == (tx.ep_count() == 1),
                "(I8) single_ep used iff ep_cnt == 1"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanFlags {
    pub barrier: bool,
    pub pipelined: bool,
    pub async_complete_possible: bool,
    pub volatile_datatype: bool,
}

#[derive(Debug, Clone)]
pub struct Plan<Ep> {
    pub phases: Vec<Phase<Ep>>,
    pub flags: PlanFlags,
    pub my_index: usize,
    pub max_frag_count: usize,
    pub temp_buffer: Option<Vec<u8>>,
    pub optimization_countdown: Option<u32>,
}

/// Resolves a peer index to a transport endpoint, consulting the group's
/// endpoint cache first and falling back to `AddressBook::lookup` (§4.2
/// step 1, (I3)).
pub trait EndpointResolver {
    type Endpoint: Clone;
    type Error: std::error::Error + Send + Sync + 'static;

    fn resolve(&mut self, peer: usize) -> std::result::Result<Self::Endpoint, Self::Error>;
}

/// Lower a topology into a [`Plan`] (§4.2). `resolver` connects endpoints
/// (step 1); `dtops`/`reduce` pick the reduction strategy (steps 3-4);
/// `limits` drives send-method selection (step 2). `reduce` is kept behind
/// an `Arc` rather than a borrow because a phase whose `comp_agg` is
/// `ReduceExternal` holds onto it for the plan's lifetime, to call back into
/// at `recv` time.
#[tracing::instrument(skip_all, fields(kind = ?params.kind, steps = steps.len()))]
pub fn lower<R>(
    steps: &[Step],
    my_index: usize,
    params: &CollectiveParams,
    limits: &TransportLimits,
    resolver: &mut R,
    dtops: &dyn DatatypeOps,
    reduce: Arc<dyn ReduceOps>,
) -> Result<Plan<R::Endpoint>>
where
    R: EndpointResolver,
{
    if dtops.is_integer(params.recv_dt).is_none() && !dtops.is_float(params.recv_dt) {
        return Err(Error::DatatypeUnsupported);
    }
    let dt_size = dtops
        .element_size(params.recv_dt)
        .ok_or(Error::DatatypeUnsupported)?;

    let barrier = matches!(params.kind, CollectiveKind::Barrier);
    let reduce_kind = params.op.map(|op| reduce.operator(op).0);

    let mut phases = Vec::with_capacity(steps.len());
    let last_idx = steps.len().saturating_sub(1);

    for (i, step) in steps.iter().enumerate() {
        let rx = match &step.rx {
            None => None,
            Some(rxd) => {
                let (method, fragmented) = choose_send_method(rxd.expected_msg_size, limits);
                let frag_len = if fragmented {
                    fragment_length(limits.max_zcopy.max(limits.max_bcopy), dt_size)
                } else {
                    rxd.expected_msg_size
                };
                let frags_cnt = if fragmented && frag_len > 0 {
                    rxd.expected_msg_size.div_ceil(frag_len)
                } else {
                    usize::from(rxd.expected_msg_size > 0)
                };
                let comp_agg = CompAgg::select(
                    barrier,
                    frags_cnt,
                    rxd.from_every_peer,
                    params.op,
                    reduce_kind,
                    false,
                    method,
                    params.modifiers.concatenate(),
                );
                let comp_criteria = CompCriteria::select(frags_cnt, fragmented, method);
                let comp_action = CompAction {
                    step: i != last_idx,
                    op: i == last_idx,
                    send: matches!(comp_criteria, CompCriteria::MultipleMessagesZcopy),
                };
                let reducer = match comp_agg {
                    CompAgg::ReduceInternal => Some(Reducer::Internal(sum_le_bytes)),
                    CompAgg::ReduceExternal => params.op.map(|op| Reducer::External {
                        reduce: reduce.clone(),
                        op,
                        dt: params.recv_dt,
                    }),
                    _ => None,
                };
                Some(RxPhase {
                    step_idx: rxd.step_idx,
                    peers: rxd.peers.clone(),
                    batch_len: rxd.expected_msg_size,
                    frags_cnt,
                    comp_agg,
                    comp_criteria,
                    comp_action,
                    elem_size: dt_size,
                    reducer,
                })
            }
        };

        let tx = match &step.tx {
            None => None,
            Some(txd) => {
                let (method, fragmented) = choose_send_method(txd.msg_size, limits);
                let frag_len = if fragmented {
                    fragment_length(limits.max_zcopy.max(limits.max_bcopy), dt_size)
                } else {
                    txd.msg_size
                };
                let mut multi_eps = Vec::with_capacity(txd.peers.len());
                for &peer in &txd.peers {
                    multi_eps.push(
                        resolver
                            .resolve(peer)
                            .map_err(|e| Error::AddressLookup {
                                peer,
                                source: Box::new(e),
                            })?,
                    );
                }
                let single_ep = if multi_eps.len() == 1 {
                    multi_eps.pop()
                } else {
                    None
                };
                Some(TxPhase {
                    step_idx: txd.step_idx,
                    single_ep,
                    multi_eps,
                    length: txd.msg_size,
                    frag_len,
                    method,
                    root: txd.is_leader,
                })
            }
        };

        let flags = PhaseFlags {
            fragmented: rx
                .as_ref()
                .map(|r| r.frags_cnt > 1)
                .unwrap_or_else(|| tx.as_ref().map(|t| t.length > t.frag_len).unwrap_or(false)),
            pipelined: rx
                .as_ref()
                .map(|r| matches!(r.comp_agg, CompAgg::Pipeline))
                .unwrap_or(false),
            last_step: i == last_idx,
            expects_rx: rx.is_some(),
        };

        let phase = Phase { flags, rx, tx };
        phase.check_invariants();
        phases.push(phase);
    }

    let max_frag_count = phases
        .iter()
        .filter_map(|p| p.rx.as_ref())
        .map(|r| r.frags_cnt)
        .max()
        .unwrap_or(0);
    let pipelined = phases.iter().any(|p| p.flags.pipelined);

    Ok(Plan {
        phases,
        flags: PlanFlags {
            barrier,
            pipelined,
            async_complete_possible: true,
            volatile_datatype: false,
        },
        my_index,
        max_frag_count,
        temp_buffer: None,
        optimization_countdown: None,
    })
}

/// Convenience wrapper binding an [`AddressBook`] as an [`EndpointResolver`]
/// for transports whose "endpoint" is just the looked-up [`Address`]
/// (§4.2 step 1: "on miss, invoke the address-lookup callback").
pub struct AddressResolver<'a, A: AddressBook> {
    book: &'a A,
    cache: std::collections::HashMap<usize, crate::collab::Address>,
}

impl<'a, A: AddressBook> AddressResolver<'a, A> {
    pub fn new(book: &'a A) -> Self {
        Self {
            book,
            cache: Default::default(),
        }
    }
}

impl<'a, A: AddressBook> EndpointResolver for AddressResolver<'a, A> {
    type Endpoint = crate::collab::Address;
    type Error = A::Error;

    fn resolve(&mut self, peer: usize) -> std::result::Result<Self::Endpoint, Self::Error> {
        if let Some(addr) = self.cache.get(&peer) {
            return Ok(addr.clone());
        }
        let addr = self.book.lookup(peer)?;
        self.cache.insert(peer, addr.clone());
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{build, BuildParams, Direction, LevelPlacement, PatternKind};

    #[derive(Default)]
    struct FixedWidthU32;

    impl DatatypeOps for FixedWidthU32 {
        fn is_integer(&self, _dt: Datatype) -> Option<bool> {
            Some(false)
        }
        fn is_float(&self, _dt: Datatype) -> bool {
            false
        }
        fn span(&self, _dt: Datatype, count: usize) -> (usize, usize) {
            (count * 4, 0)
        }
        fn element_size(&self, _dt: Datatype) -> Option<usize> {
            Some(4)
        }
    }

    impl ReduceOps for FixedWidthU32 {
        fn operator(&self, _op: ReduceOp) -> (crate::collab::ReduceKind, bool) {
            (crate::collab::ReduceKind::Sum, true)
        }
        fn reduce_external(
            &self,
            _op: ReduceOp,
            _src: &[u8],
            _dst: &mut [u8],
            _count: usize,
            _dt: Datatype,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
            Ok(())
        }
    }

    #[test]
    fn send_method_picks_short_for_small_messages() {
        let limits = TransportLimits {
            max_short: 64,
            max_bcopy: 4096,
            zcopy_threshold: 8192,
            max_zcopy: 1 << 20,
        };
        assert_eq!(choose_send_method(16, &limits).0, SendMethod::Short);
        assert_eq!(choose_send_method(200, &limits).0, SendMethod::Bcopy);
        assert_eq!(choose_send_method(0, &limits).0, SendMethod::Mock);
    }

    #[test]
    fn fragment_length_is_a_multiple_of_dtype_size() {
        assert_eq!(fragment_length(1000, 8), 1000 - (1000 % 8));
        assert_eq!(fragment_length(1000, 8) % 8, 0);
    }

    #[test]
    fn comp_agg_picks_reduce_internal_for_commutative_sum() {
        let agg = CompAgg::select(
            false,
            1,
            true,
            Some(ReduceOp(0)),
            Some(crate::collab::ReduceKind::Sum),
            false,
            SendMethod::Short,
            false,
        );
        assert_eq!(agg, CompAgg::ReduceInternal);
    }

    #[test]
    fn comp_agg_is_nop_for_barrier() {
        assert_eq!(
            CompAgg::select(true, 1, false, None, None, false, SendMethod::Short, false),
            CompAgg::Nop
        );
    }

    struct Echo;
    impl EndpointResolver for Echo {
        type Endpoint = usize;
        type Error = std::convert::Infallible;
        fn resolve(&mut self, peer: usize) -> std::result::Result<usize, Self::Error> {
            Ok(peer)
        }
    }

    #[test]
    fn lowering_a_barrier_tree_produces_monotone_phases() {
        let steps = build(
            &BuildParams {
                me: 0,
                group_size: 4,
                root: Some(0),
                levels: vec![LevelPlacement {
                    first: 0,
                    stride: 1,
                    count: 4,
                    pattern: PatternKind::KaryTree,
                    radix_or_factor: 2,
                    tx_msg_size: 0,
                    rx_msg_size: 0,
                    inter_host: false,
                }],
                direction: Direction::Full,
                multiroot_thresh: 0,
            },
            None,
        )
        .unwrap();

        let limits = TransportLimits {
            max_short: 64,
            max_bcopy: 4096,
            zcopy_threshold: 8192,
            max_zcopy: 1 << 20,
        };
        let params = CollectiveParams {
            kind: CollectiveKind::Barrier,
            root: Some(0),
            send_dt: Datatype(0),
            recv_dt: Datatype(0),
            count: 0,
            op: None,
            modifiers: Modifiers::default(),
        };
        let dt = Arc::new(FixedWidthU32::default());
        let mut resolver = Echo;
        let plan = lower(&steps, 0, &params, &limits, &mut resolver, dt.as_ref(), dt.clone()).unwrap();
        assert!(plan.flags.barrier);
        assert!(plan.phases.last().unwrap().flags.last_step);
        let mut last = 0u8;
        for p in &plan.phases {
            let idx = p
                .rx
                .as_ref()
                .map(|r| r.step_idx)
                .or_else(|| p.tx.as_ref().map(|t| t.step_idx))
                .unwrap();
            assert!(idx.get() >= last);
            last = idx.get();
        }
    }
}
