// SPDX-License-Identifier: GPL-3.0-or-later

//! Immutable configuration bundle (DESIGN NOTES §9: "re-architect [the
//! global parameter singleton] as an immutable configuration bundle stored
//! once in the context and referenced by the group; no ambient mutation").
//!
//! This crate does not parse environment variables itself -- configuration
//! parsing is explicitly out of scope (§1) -- the embedder builds a
//! `Config` however it likes (env, file, hardcoded) and hands it to
//! [`crate::group::Context::new`].

use std::time::Duration;

/// Knobs of §6, "Environment-configurable knobs". Field names mirror the
/// `OVER_UCT_*` names so a reader who knows the original can find the
/// mapping at a glance, without this crate parsing the env vars itself.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum level member count to attempt a hardware incast transport.
    /// Independent of `bcast_member_thresh` (§10.6): a level can be large
    /// enough to batch an incast but still use point-to-point bcast, or
    /// vice versa.
    pub incast_member_thresh: usize,
    /// Minimum level member count to attempt a hardware bcast transport.
    pub bcast_member_thresh: usize,
    /// Per-destination size above which zcopy is preferred over bcopy.
    pub zcopy_total_thresh: usize,
    /// Resend timer tick.
    pub resend_timer_tick: Duration,
    /// Force datatype re-resolution on every `collective_create`, even on a
    /// plan-cache hit (§10.6).
    pub volatile_datatypes: bool,
    /// Default tree radix for k-ary/k-nomial topology levels.
    pub tree_radix: usize,
    /// Default recursive factor for recursive-k/Bruck topology levels.
    pub recursive_factor: usize,
    /// Number of concurrent-operation slots per group; must be a power of
    /// two, `>= 8` and `<= 64` (§3, `Slot`).
    pub slot_count: usize,
    /// Maximum plans retained per group's cache before eviction (§4.3).
    pub plan_cache_limit: usize,
    /// Level size at or below which a fan-in's result is replicated via a
    /// multi-root step instead of a fan-out (§4.1, "Multi-root step").
    pub multiroot_thresh: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            incast_member_thresh: 5,
            bcast_member_thresh: 5,
            zcopy_total_thresh: 8 * 1024,
            resend_timer_tick: Duration::from_millis(100),
            volatile_datatypes: false,
            tree_radix: 2,
            recursive_factor: 2,
            slot_count: 8,
            plan_cache_limit: 64,
            multiroot_thresh: 4,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if !self.slot_count.is_power_of_two() || !(8..=64).contains(&self.slot_count) {
            return Err(crate::error::Error::InvalidParam(format!(
                "slot_count must be a power of two in [8, 64], got {}",
                self.slot_count
            )));
        }
        if self.tree_radix < 2 {
            return Err(crate::error::Error::InvalidParam(
                "tree_radix must be >= 2".into(),
            ));
        }
        if self.recursive_factor < 2 {
            return Err(crate::error::Error::InvalidParam(
                "recursive_factor must be >= 2".into(),
            ));
        }
        Ok(())
    }
}
