// SPDX-License-Identifier: GPL-3.0-or-later

//! Error taxonomy for the planner/executor, and the narrowing of that
//! taxonomy onto the fixed [`Status`] enum callers and FFI boundaries see.

use thiserror::Error;

use crate::ids::{GroupId, MemberIndex, StepIdx};

/// The fixed status taxonomy exposed at the interface boundary (§6/§7).
///
/// Every [`Error`] narrows onto exactly one of these; `Status` itself never
/// carries context, so logging should happen at the point an `Error` is
/// produced, not after it has been reduced to a `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InProgress,
    NoResource,
    NoMemory,
    InvalidParam,
    Unsupported,
    Unreachable,
    ExceedsLimit,
    NotImplemented,
    NotConnected,
    Canceled,
}

/// Failure modes of the planner/executor.
///
/// Invariant violations (I1–I11 of the data model) are not represented here:
/// they indicate an internal bug, not a condition a caller can recover from,
/// and are raised via `debug_assert!`/`unreachable!` at the point of
/// violation instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("group {0:?} already exists in this context")]
    DuplicateGroup(GroupId),

    #[error("member index {index} out of range for group of size {size}")]
    MemberOutOfRange { index: MemberIndex, size: usize },

    #[error("invalid collective parameters: {0}")]
    InvalidParam(String),

    #[error("topology level exceeds its step-index bit budget")]
    ExceedsLimit,

    #[error("pattern is not supported by this topology builder: {0}")]
    Unsupported(String),

    #[error("failed to resolve address for peer {peer:?}")]
    AddressLookup {
        peer: MemberIndex,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("datatype unsupported by the collaborator's datatype callbacks")]
    DatatypeUnsupported,

    #[error("collective transport rejected {what}, falling back to point-to-point")]
    CollectiveTransportMismatch { what: &'static str },

    #[error("registration of the send buffer failed")]
    RegistrationFailed(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("all {capacity} concurrent-operation slots are occupied")]
    ConcurrentOpsExhausted { capacity: usize },

    #[error("no operation is in flight for collective id matching step {0:?}")]
    NoSuchOperation(StepIdx),

    #[error("transport reported a transient send stall")]
    TransientStall,

    #[error("group has operations in the resend list and cannot be destroyed cleanly")]
    GroupBusy,

    #[error("cancellation of an in-flight collective is not implemented")]
    NotImplemented,

    #[error("the external reduction callback failed")]
    ReduceExternal(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error(transparent)]
    Transport(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Narrow this error onto the fixed status taxonomy of §6/§7.
    pub fn status(&self) -> Status {
        use Error::*;
        match self {
            DuplicateGroup(_) | MemberOutOfRange { .. } | InvalidParam(_) => Status::InvalidParam,
            ExceedsLimit => Status::ExceedsLimit,
            Unsupported(_) | DatatypeUnsupported | CollectiveTransportMismatch { .. } => {
                Status::Unsupported
            }
            AddressLookup { .. } => Status::NotConnected,
            RegistrationFailed(_) => Status::NoMemory,
            ConcurrentOpsExhausted { .. } | TransientStall => Status::NoResource,
            NoSuchOperation(_) => Status::InvalidParam,
            GroupBusy => Status::NoResource,
            NotImplemented => Status::NotImplemented,
            ReduceExternal(_) => Status::Unsupported,
            Transport(_) => Status::Unreachable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
