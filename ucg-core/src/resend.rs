// SPDX-License-Identifier: GPL-3.0-or-later

//! Resend Service (§4.6).
//!
//! Each group keeps an intrusive list of in-flight sends that are still
//! waiting on a completion callback; a periodic timer walks the list and
//! asks the transport to retry anything older than one tick. The timer
//! itself is feature-gated behind `resend-timer` (default on): a caller that
//! drives its own event loop can call [`ResendList::sweep`] directly and
//! skip the background task entirely.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::ids::{CollId, MemberIndex};

/// One outstanding send the resend timer may need to kick.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub coll_id: CollId,
    pub dest: MemberIndex,
    pub attempt: u32,
}

/// Monotonically increasing logical tick, supplied by the caller (or the
/// background timer) rather than read from the clock in here -- keeps this
/// module free of any `Instant::now()` so it stays deterministic under test.
pub type Tick = u64;

/// Per-group intrusive resend bookkeeping, guarded by a single lock (§5:
/// "the resend list lock is acquired only around list mutation, never
/// around a transport call").
#[derive(Default)]
pub struct ResendList {
    inner: Mutex<BTreeMap<u64, (Tick, PendingSend)>>,
    next_handle: Mutex<u64>,
}

/// Opaque handle returned by [`ResendList::schedule`], used to cancel a
/// pending resend once its completion callback actually fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResendHandle(u64);

impl ResendList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, at: Tick, send: PendingSend) -> ResendHandle {
        let mut next = self.next_handle.lock();
        let handle = *next;
        *next += 1;
        self.inner.lock().insert(handle, (at, send));
        ResendHandle(handle)
    }

    /// Cancel a scheduled resend; a no-op if it already fired or was
    /// cancelled (completions and timer sweeps can race benignly).
    pub fn cancel(&self, handle: ResendHandle) {
        self.inner.lock().remove(&handle.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Pull out (and remove) every entry scheduled at or before `now`, for
    /// the caller to hand back to the transport. Entries due but not yet
    /// acknowledged by a subsequent `schedule`/`cancel` are the caller's to
    /// resend -- this list does not retry on the caller's behalf.
    pub fn sweep(&self, now: Tick) -> Vec<(ResendHandle, PendingSend)> {
        let mut inner = self.inner.lock();
        let due: Vec<u64> = inner
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(h, _)| *h)
            .collect();
        due.into_iter()
            .filter_map(|h| inner.remove(&h).map(|(_, send)| (ResendHandle(h), send)))
            .collect()
    }
}

#[cfg(feature = "resend-timer")]
pub mod timer {
    //! Background tick source: a fixed-period tokio timer that calls back
    //! into a closure supplied by the embedder, rather than owning the
    //! retry policy itself.

    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinHandle;

    use super::{ResendList, Tick};

    /// Spawns a task that increments a logical tick counter every `period`
    /// and sweeps `list`, handing due sends to `on_due`. Dropping the
    /// returned handle aborts the task.
    pub fn spawn(
        list: Arc<ResendList>,
        period: Duration,
        mut on_due: impl FnMut(Vec<(super::ResendHandle, super::PendingSend)>) + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick: Tick = 0;
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                tick += 1;
                let due = list.sweep(tick);
                if !due.is_empty() {
                    tracing::debug!(tick, due = due.len(), "resend sweep");
                    on_due(due);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(coll: u32) -> PendingSend {
        PendingSend {
            coll_id: CollId(coll),
            dest: 3,
            attempt: 0,
        }
    }

    #[test]
    fn sweep_returns_only_due_entries() {
        let list = ResendList::new();
        list.schedule(5, send(1));
        list.schedule(10, send(2));
        let due = list.sweep(7);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.coll_id, CollId(1));
        assert_eq!(list.len(), 1, "the not-yet-due entry stays scheduled");
    }

    #[test]
    fn cancel_before_sweep_removes_entry() {
        let list = ResendList::new();
        let h = list.schedule(1, send(9));
        list.cancel(h);
        assert!(list.sweep(5).is_empty());
    }

    #[test]
    fn sweep_is_idempotent_per_entry() {
        let list = ResendList::new();
        list.schedule(1, send(1));
        let first = list.sweep(1);
        let second = list.sweep(1);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
