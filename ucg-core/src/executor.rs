// SPDX-License-Identifier: GPL-3.0-or-later

//! Executor (§4.4): drives a lowered [`Plan`] phase by phase against a
//! [`Transport`]/[`Completion`] pair, using a group's [`SlotRing`] for
//! message matching and its [`ResendList`] for stalled sends.
//!
//! §5 fencing: a slot is occupied (published) before any send for its first
//! phase goes out, and freed only after the completion callback has been
//! queued -- never before, so a reused `coll_id` can't observe a slot that
//! looks free while its previous occupant's completion is still in flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    collab::{Completion, ReqToken, SendOutcome, Transport},
    error::{Error, Result, Status},
    ids::CollId,
    plan::{CompAction, CompAgg, CompCriteria, Phase, Plan, Reducer},
    resend::{PendingSend, ResendList},
    slot::{Descriptor, SlotRing},
    wire::{Header, HEADER_LEN},
};

/// The embedder's receive buffer for one running operation, shared with the
/// caller so it can read the result once `Completion::complete` fires (§3
/// Operation, `rx.buffer`).
pub type RecvBuffer = Arc<Mutex<Vec<u8>>>;

struct OpState<Ep> {
    plan: Arc<Plan<Ep>>,
    req: ReqToken,
    persistent: bool,
    phase: usize,
    received: usize,
    recv_buffer: Option<RecvBuffer>,
}

impl<Ep> OpState<Ep> {
    fn current(&self) -> &Phase<Ep> {
        &self.plan.phases[self.phase]
    }

    fn expected_messages(&self) -> usize {
        self.current()
            .rx
            .as_ref()
            .map(|rx| rx.peers.len().max(1) * rx.frags_cnt.max(1))
            .unwrap_or(0)
    }
}

/// Drives plans for a single group. One `Executor` is shared by every
/// in-flight operation of that group; `ops` is keyed by [`CollId`] the same
/// way the slot ring is, since at most one operation owns a given id at a
/// time (I11).
pub struct Executor<T: Transport, C: Completion> {
    group_id: crate::ids::GroupId,
    transport: Arc<T>,
    completion: Arc<C>,
    resend: Arc<ResendList>,
    ops: Mutex<HashMap<CollId, OpState<T::Endpoint>>>,
}

impl<T: Transport, C: Completion> Executor<T, C> {
    pub fn new(
        group_id: crate::ids::GroupId,
        transport: Arc<T>,
        completion: Arc<C>,
        resend: Arc<ResendList>,
    ) -> Self {
        Self {
            group_id,
            transport,
            completion,
            resend,
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// §4.4 `trigger`: occupy a slot, start phase 0. `recv_buffer` is the
    /// embedder's receive buffer for this operation, if the collective has
    /// one to write into (a barrier has none); `recv`'s `WRITE_*`/`REDUCE_*`
    /// actions write through it.
    pub fn trigger(
        &self,
        slots: &SlotRing,
        plan: Arc<Plan<T::Endpoint>>,
        coll_id: CollId,
        req: ReqToken,
        persistent: bool,
        recv_buffer: Option<RecvBuffer>,
    ) -> Result<()> {
        let slot = slots.get(coll_id);
        if !slot.is_free() {
            return Err(Error::ConcurrentOpsExhausted {
                capacity: slots.len(),
            });
        }
        let Some(first) = plan.phases.first() else {
            self.completion.complete(req, Status::Ok);
            return Ok(());
        };
        let step_idx = first
            .rx
            .as_ref()
            .map(|r| r.step_idx)
            .or_else(|| first.tx.as_ref().map(|t| t.step_idx))
            .expect("a phase has at least one of rx/tx");
        slot.occupy(crate::wire::LocalId::of(step_idx, coll_id.wire_byte()));

        self.ops.lock().insert(
            coll_id,
            OpState {
                plan,
                req,
                persistent,
                phase: 0,
                received: 0,
                recv_buffer,
            },
        );
        self.advance_if_ready(slots, coll_id)
    }

    /// §4.4 `progress`: drive the transport and retry anything the resend
    /// timer has surfaced as due.
    pub fn progress(&self) -> usize {
        self.transport.progress()
    }

    /// §4.4 `tick`: drain any early-arrived messages the slot buffered
    /// before this operation's current phase was reached.
    pub fn tick(&self, slots: &SlotRing, coll_id: CollId) -> Result<()> {
        let slot = slots.get(coll_id);
        for desc in slot.drain_matching() {
            self.recv(slots, coll_id, desc)?;
        }
        Ok(())
    }

    /// §4.4 `recv`: apply the current phase's `comp_agg` action to an
    /// arrived message -- copying or reducing the payload into the
    /// operation's receive buffer, if it has one -- and, once the phase's
    /// completion criteria are met, advance.
    pub fn recv(&self, slots: &SlotRing, coll_id: CollId, desc: Descriptor) -> Result<()> {
        let mut ops = self.ops.lock();
        let Some(op) = ops.get_mut(&coll_id) else {
            return Err(Error::NoSuchOperation(desc.header.step_idx_typed()));
        };
        let (comp_agg, comp_criteria, action, elem_size, reducer) = {
            let rx = op
                .current()
                .rx
                .as_ref()
                .ok_or(Error::NoSuchOperation(desc.header.step_idx_typed()))?;
            (
                rx.comp_agg,
                rx.comp_criteria,
                rx.comp_action,
                rx.elem_size,
                rx.reducer.clone(),
            )
        };
        let recv_buffer = op.recv_buffer.clone();

        if let Some(buffer) = recv_buffer {
            let offset = desc.header.remote_offset as usize;
            let mut buf = buffer.lock();
            match comp_agg {
                CompAgg::Nop | CompAgg::RemoteKey => {}
                CompAgg::WriteNoOffset => {
                    let n = desc.payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&desc.payload[..n]);
                }
                CompAgg::WriteWithOffset | CompAgg::Pipeline => {
                    let end = (offset + desc.payload.len()).min(buf.len());
                    if end > offset {
                        buf[offset..end].copy_from_slice(&desc.payload[..end - offset]);
                    }
                }
                CompAgg::ReduceInternal | CompAgg::ReduceExternal => {
                    let n = desc.payload.len().min(buf.len());
                    match &reducer {
                        Some(Reducer::Internal(f)) => f(&mut buf[..n], &desc.payload[..n], elem_size.max(1)),
                        Some(Reducer::External { reduce, op: rop, dt }) => {
                            let count = if elem_size > 0 { n / elem_size } else { n };
                            reduce
                                .reduce_external(*rop, &desc.payload[..n], &mut buf[..n], count, *dt)
                                .map_err(Error::ReduceExternal)?;
                        }
                        None => {}
                    }
                }
            }
        }

        op.received += 1;
        let expected = op.expected_messages();
        let done = match comp_criteria {
            CompCriteria::SingleMessage => op.received >= 1,
            CompCriteria::MultipleMessages | CompCriteria::MultipleMessagesZcopy => {
                op.received >= expected
            }
        };
        drop(ops);

        if done {
            self.apply_comp_action(slots, coll_id, action)?;
        }
        Ok(())
    }

    fn apply_comp_action(&self, slots: &SlotRing, coll_id: CollId, action: CompAction) -> Result<()> {
        if action.step {
            self.step_phase(slots, coll_id)?;
        }
        if action.op {
            self.finish(slots, coll_id, Status::Ok);
        }
        Ok(())
    }

    fn step_phase(&self, slots: &SlotRing, coll_id: CollId) -> Result<()> {
        tracing::debug!(coll_id = coll_id.0, "advancing to next phase");
        {
            let mut ops = self.ops.lock();
            if let Some(op) = ops.get_mut(&coll_id) {
                op.phase += 1;
                op.received = 0;
            }
        }
        self.advance_if_ready(slots, coll_id)
    }

    /// Send the new current phase's `tx`, if any, and re-publish the slot's
    /// expectation to the new phase's step index so arriving messages route
    /// correctly; phases with no `rx` (pure sends) complete immediately.
    fn advance_if_ready(&self, slots: &SlotRing, coll_id: CollId) -> Result<()> {
        let (step_idx, has_rx, tx_targets, is_last, frag_len) = {
            let ops = self.ops.lock();
            let Some(op) = ops.get(&coll_id) else {
                return Ok(());
            };
            let phase = op.current();
            let step_idx = phase
                .rx
                .as_ref()
                .map(|r| r.step_idx)
                .or_else(|| phase.tx.as_ref().map(|t| t.step_idx))
                .expect("a phase has at least one of rx/tx");
            let targets: Vec<T::Endpoint> = phase
                .tx
                .as_ref()
                .map(|tx| {
                    tx.single_ep
                        .clone()
                        .into_iter()
                        .chain(tx.multi_eps.iter().cloned())
                        .collect()
                })
                .unwrap_or_default();
            (
                step_idx,
                phase.rx.is_some(),
                targets,
                phase.flags.last_step,
                phase.tx.as_ref().map(|t| t.frag_len).unwrap_or(0),
            )
        };

        slots
            .get(coll_id)
            .occupy(crate::wire::LocalId::of(step_idx, coll_id.wire_byte()));

        for (i, ep) in tx_targets.iter().enumerate() {
            self.send_one(coll_id, step_idx, ep, frag_len, i)?;
        }

        if !has_rx {
            if is_last {
                self.finish(slots, coll_id, Status::Ok);
            } else {
                self.step_phase(slots, coll_id)?;
            }
        }
        Ok(())
    }

    fn send_one(
        &self,
        coll_id: CollId,
        step_idx: crate::ids::StepIdx,
        ep: &T::Endpoint,
        frag_len: usize,
        fragment_index: usize,
    ) -> Result<()> {
        let header = Header {
            remote_offset: (fragment_index * frag_len) as u32,
            group_id: self.group_id,
            coll_id: coll_id.wire_byte(),
            step_idx: step_idx.get(),
        };
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&header.to_bytes());
        match self
            .transport
            .send(ep, &buf)
            .map_err(|e| Error::Transport(Box::new(e)))?
        {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Stalled => {
                self.resend.schedule(
                    1,
                    PendingSend {
                        coll_id,
                        dest: fragment_index,
                        attempt: 0,
                    },
                );
                Ok(())
            }
        }
    }

    fn finish(&self, slots: &SlotRing, coll_id: CollId, status: Status) {
        let op = self.ops.lock().remove(&coll_id);
        slots.get(coll_id).free();
        if let Some(op) = op {
            self.completion.complete(op.req, status);
            if op.persistent {
                // Persistent requests are re-triggered by the embedder with
                // the same plan (§6 `collective_start` on a persistent
                // request); this crate does not re-arm automatically.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{Address, ReqToken};
    use crate::ids::GroupId;
    use crate::plan::{CompAction, PhaseFlags, PlanFlags, RxPhase, TxPhase};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }
    impl Transport for MockTransport {
        type Endpoint = usize;
        type Error = std::convert::Infallible;
        fn connect(&self, _addr: &Address) -> std::result::Result<usize, Self::Error> {
            Ok(0)
        }
        fn send(&self, _ep: &usize, payload: &[u8]) -> std::result::Result<SendOutcome, Self::Error> {
            self.sent.lock().push(payload.to_vec());
            Ok(SendOutcome::Sent)
        }
        fn progress(&self) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct CountingCompletion {
        completions: AtomicUsize,
    }
    impl Completion for CountingCompletion {
        fn complete(&self, _req: ReqToken, status: Status) {
            assert_eq!(status, Status::Ok);
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn barrier_plan() -> Arc<Plan<usize>> {
        Arc::new(Plan {
            phases: vec![Phase {
                flags: PhaseFlags {
                    fragmented: false,
                    pipelined: false,
                    last_step: true,
                    expects_rx: true,
                },
                rx: Some(RxPhase {
                    step_idx: crate::ids::StepIdx::FIRST,
                    peers: vec![1],
                    batch_len: 0,
                    frags_cnt: 1,
                    comp_agg: CompAgg::Nop,
                    comp_criteria: CompCriteria::SingleMessage,
                    comp_action: CompAction {
                        step: false,
                        op: true,
                        send: false,
                    },
                    elem_size: 0,
                    reducer: None,
                }),
                tx: Some(TxPhase {
                    step_idx: crate::ids::StepIdx::FIRST,
                    single_ep: Some(1usize),
                    multi_eps: vec![],
                    length: 0,
                    frag_len: 0,
                    method: crate::plan::SendMethod::Mock,
                    root: false,
                }),
            }],
            flags: PlanFlags {
                barrier: true,
                pipelined: false,
                async_complete_possible: true,
                volatile_datatype: false,
            },
            my_index: 0,
            max_frag_count: 1,
            temp_buffer: None,
            optimization_countdown: None,
        })
    }

    #[test]
    fn trigger_sends_and_recv_completes_a_single_phase_barrier() {
        let transport = Arc::new(MockTransport::default());
        let completion = Arc::new(CountingCompletion::default());
        let resend = Arc::new(ResendList::new());
        let exec = Executor::new(
            GroupId::new(1).unwrap(),
            transport.clone(),
            completion.clone(),
            resend,
        );
        let slots = SlotRing::new(8);

        let coll_id = CollId(1);
        exec.trigger(&slots, barrier_plan(), coll_id, ReqToken(42), false, None)
            .unwrap();
        assert_eq!(transport.sent.lock().len(), 1, "the tx side fired immediately");

        let desc = Descriptor {
            header: Header {
                remote_offset: 0,
                group_id: GroupId::new(1).unwrap(),
                coll_id: coll_id.wire_byte(),
                step_idx: 1,
            },
            payload: vec![],
        };
        exec.recv(&slots, coll_id, desc).unwrap();
        assert_eq!(completion.completions.load(Ordering::SeqCst), 1);
        assert!(slots.get(coll_id).is_free(), "slot freed after completion");
    }

    #[test]
    fn second_trigger_on_same_slot_fails_while_first_in_flight() {
        let transport = Arc::new(MockTransport::default());
        let completion = Arc::new(CountingCompletion::default());
        let resend = Arc::new(ResendList::new());
        let exec = Executor::new(GroupId::new(1).unwrap(), transport, completion, resend);
        let slots = SlotRing::new(8);
        let coll_id = CollId(2);
        exec.trigger(&slots, barrier_plan(), coll_id, ReqToken(1), false, None)
            .unwrap();
        let err = exec
            .trigger(&slots, barrier_plan(), coll_id, ReqToken(2), false, None)
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentOpsExhausted { .. }));
    }
}
