// SPDX-License-Identifier: GPL-3.0-or-later

//! Callbacks the core consumes from collaborators (§6).
//!
//! Everything in this module is a trait the embedding runtime implements:
//! the transport, memory registration, datatype introspection and the
//! user's reduction operator are all out of scope for this crate (§1) and
//! are reached only through these seams, mirroring how the crate this
//! workspace was adapted from treats its own transport/identity/storage
//! layers as generic collaborators rather than concrete dependencies.

use crate::ids::MemberIndex;

/// Opaque transport address, as returned by [`AddressBook::lookup`].
#[derive(Debug, Clone)]
pub struct Address(pub Vec<u8>);

/// `address_lookup`/`address_release` (§6).
pub trait AddressBook: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn lookup(&self, peer: MemberIndex) -> Result<Address, Self::Error>;
}

/// `neighbors_count`/`neighbors_query` (§6), used by the `Neighbor` topology
/// pattern (§4.1).
pub trait Neighbors: Send + Sync {
    fn degrees(&self) -> (usize, usize);
    fn peers(&self) -> (Vec<MemberIndex>, Vec<MemberIndex>);
}

/// Transport-visible datatype handle. Opaque to the core; collaborators
/// interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Datatype(pub u32);

/// `datatype_convert`/`datatype_is_integer`/`datatype_is_fp`/
/// `datatype_get_span` (§6).
pub trait DatatypeOps: Send + Sync {
    fn is_integer(&self, dt: Datatype) -> Option<bool>;
    fn is_float(&self, dt: Datatype) -> bool;
    /// `(span, gap)`: `span` is the number of bytes `count` elements
    /// occupy including internal padding, `gap` is the distance between the
    /// start of the buffer and the first real byte.
    fn span(&self, dt: Datatype, count: usize) -> (usize, usize);
    /// Element width in bytes, when the datatype is a fixed-width scalar.
    fn element_size(&self, dt: Datatype) -> Option<usize>;
}

/// Reduction operator handle, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReduceOp(pub u32);

/// Built-in reduction kinds the lowerer may pick in place of the user's
/// external callback (§4.2 step 4). Non-commutative reductions are a
/// Non-goal (§1): `is_commutative` is assumed true whenever this crate picks
/// a built-in, and callers must not request one otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    External,
}

/// `reduce_op_get_operator`/`reduce_external` (§6).
pub trait ReduceOps: Send + Sync {
    fn operator(&self, op: ReduceOp) -> (ReduceKind, bool /* is_commutative */);

    /// Invoked only for `ReduceKind::External`. `dst` already holds the
    /// running reduction; `src` is the newly arrived operand.
    fn reduce_external(
        &self,
        op: ReduceOp,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        dt: Datatype,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// Opaque token identifying the caller's outstanding request, threaded
/// through unchanged from `collective_start` to `Completion::complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqToken(pub u64);

/// `completion(req, status)` (§6). The source's eight function pointers
/// (sync/async x success/failure x persistent/not) collapse to one method:
/// `sync` vs `async` is which thread calls it (the caller's, for an inline
/// completion, or the resend timer's), `persistent` is a property of the
/// plan the embedder already knows from `collective_create`, and
/// success/failure is just `status`.
pub trait Completion: Send + Sync {
    fn complete(&self, req: ReqToken, status: crate::error::Status);
}

/// Minimal send-side surface the executor needs from the point-to-point
/// transport (§1: the transport implementation itself is out of scope, this
/// is only the seam). `NoResource` is communicated as
/// `Ok(SendOutcome::Stalled)`, not as an `Err`, because it is an expected,
/// recoverable outcome the executor's resend path handles -- the embedder's
/// `Err` reserves for actually-exceptional transport failures.
pub trait Transport: Send + Sync {
    type Endpoint: Clone + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&self, addr: &Address) -> Result<Self::Endpoint, Self::Error>;

    /// Send `payload` (header already prepended by the caller) to `ep`.
    fn send(
        &self,
        ep: &Self::Endpoint,
        payload: &[u8],
    ) -> Result<SendOutcome, Self::Error>;

    /// Drive the transport's internal progress once; returns the number of
    /// completions processed (used only as a "did anything happen" signal).
    fn progress(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Stalled,
}
