// SPDX-License-Identifier: GPL-3.0-or-later

//! An in-memory stand-in for the collaborators `ucg-core` reaches through
//! its traits (§6): a loopback transport that simply records what it was
//! asked to send, a completion sink that records every callback, a flat
//! address book, and a fixed-width-u32 datatype/reduce pair. None of this
//! does anything a real transport or registration layer would -- it exists
//! only so the scenarios below can drive the planner and executor without a
//! network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ucg_core::collab::{
    Address, AddressBook, Completion, Datatype, DatatypeOps, ReduceKind, ReduceOp, ReduceOps,
    ReqToken, SendOutcome, Transport,
};
use ucg_core::error::Status;
use ucg_core::plan::EndpointResolver;

/// Records every payload handed to `send`, keyed by destination peer index
/// (used directly as the transport endpoint -- there is no real connection
/// to set up). `stall_remaining` lets a scenario force the first N sends to
/// come back as `SendOutcome::Stalled`, exercising the resend path (§4.6).
#[derive(Default)]
pub struct Loopback {
    sent: Mutex<Vec<(usize, Vec<u8>)>>,
    stall_remaining: AtomicUsize,
}

impl Loopback {
    pub fn stalling_first(n: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            stall_remaining: AtomicUsize::new(n),
        }
    }

    pub fn sent_to(&self) -> Vec<usize> {
        self.sent.lock().unwrap().iter().map(|(ep, _)| *ep).collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for Loopback {
    type Endpoint = usize;
    type Error = std::convert::Infallible;

    fn connect(&self, addr: &Address) -> Result<usize, Self::Error> {
        Ok(addr.0.first().copied().unwrap_or(0) as usize)
    }

    fn send(&self, ep: &usize, payload: &[u8]) -> Result<SendOutcome, Self::Error> {
        if self.stall_remaining.load(Ordering::SeqCst) > 0 {
            self.stall_remaining.fetch_sub(1, Ordering::SeqCst);
            return Ok(SendOutcome::Stalled);
        }
        self.sent.lock().unwrap().push((*ep, payload.to_vec()));
        Ok(SendOutcome::Sent)
    }

    fn progress(&self) -> usize {
        0
    }
}

/// Resolves a peer's absolute index straight to itself: the loopback
/// transport has no real addressing, so the peer index already is the
/// endpoint (§4.2 step 1).
pub struct IdentityResolver;

impl EndpointResolver for IdentityResolver {
    type Endpoint = usize;
    type Error = std::convert::Infallible;

    fn resolve(&mut self, peer: usize) -> Result<usize, Self::Error> {
        Ok(peer)
    }
}

/// Every peer's address is just its index, one byte (§6 `address_lookup`).
pub struct FlatAddressBook;

impl AddressBook for FlatAddressBook {
    type Error = std::convert::Infallible;

    fn lookup(&self, peer: usize) -> Result<Address, Self::Error> {
        Ok(Address(vec![peer as u8]))
    }
}

/// A single commutative-sum 32-bit integer datatype -- enough to exercise
/// every branch of the completion-aggregation table (§4.2 step 5) without
/// this crate needing to know what a real numeric datatype registry looks
/// like.
#[derive(Default)]
pub struct U32Ops;

impl DatatypeOps for U32Ops {
    fn is_integer(&self, _dt: Datatype) -> Option<bool> {
        Some(true)
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

impl ReduceOps for U32Ops {
    fn operator(&self, _op: ReduceOp) -> (ReduceKind, bool) {
        (ReduceKind::Sum, true)
    }

    fn reduce_external(
        &self,
        _op: ReduceOp,
        _src: &[u8],
        _dst: &mut [u8],
        _count: usize,
        _dt: Datatype,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(())
    }
}

/// Records every `(req, status)` pair handed to `complete` (§6 `completion`).
#[derive(Default)]
pub struct RecordingCompletion {
    completions: Mutex<Vec<(ReqToken, Status)>>,
}

impl RecordingCompletion {
    pub fn count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.completions.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

impl Completion for RecordingCompletion {
    fn complete(&self, req: ReqToken, status: Status) {
        self.completions.lock().unwrap().push((req, status));
    }
}
