// SPDX-License-Identifier: GPL-3.0-or-later

//! Topology Builder (§4.1).
//!
//! Consumes group-level placement and produces an ordered list of abstract
//! [`Step`]s. Pure function of its inputs (plus, for the `Neighbor`
//! pattern, the [`Neighbors`] collaborator) -- it never touches a group's
//! endpoint table or any transport; that happens one layer up, in
//! [`crate::plan`].

use crate::{
    collab::Neighbors,
    error::{Error, Result},
    ids::StepIdx,
};

/// Which communication pattern a [`LevelPlacement`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    KaryTree,
    KnomialTree,
    Ring,
    RingSingle,
    RecursiveK,
    Bruck,
    Pairwise,
    Neighbor,
}

/// One hierarchy level's placement and chosen pattern (§4.1 inputs).
#[derive(Debug, Clone)]
pub struct LevelPlacement {
    /// Absolute index of the first member participating at this level.
    pub first: usize,
    /// Stride between consecutive members' absolute indices at this level.
    pub stride: usize,
    /// Number of members participating at this level.
    pub count: usize,
    pub pattern: PatternKind,
    /// Tree radix (tree patterns) or recursive factor (recursive-k/Bruck).
    pub radix_or_factor: usize,
    pub tx_msg_size: usize,
    pub rx_msg_size: usize,
    /// Whether this level crosses a host boundary (I5: a single step must
    /// not mix intra-host and inter-host communication).
    pub inter_host: bool,
}

/// Which phases of the collective to emit (§4.1 "global flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FaninOnly,
    FanoutOnly,
    Full,
    RingSingle,
}

#[derive(Debug, Clone)]
pub struct BuildParams {
    pub me: usize,
    pub group_size: usize,
    pub root: Option<usize>,
    pub levels: Vec<LevelPlacement>,
    pub direction: Direction,
    pub multiroot_thresh: usize,
}

#[derive(Debug, Clone)]
pub struct RxDescriptor {
    pub step_idx: StepIdx,
    pub level: usize,
    /// Absolute peer indices this rank expects to receive from.
    pub peers: Vec<usize>,
    pub from_every_peer: bool,
    pub is_leader: bool,
    pub expected_msg_size: usize,
}

#[derive(Debug, Clone)]
pub struct TxDescriptor {
    pub step_idx: StepIdx,
    pub level: usize,
    /// Absolute peer indices this rank sends to.
    pub peers: Vec<usize>,
    pub is_leader: bool,
    pub msg_size: usize,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub rx: Option<RxDescriptor>,
    pub tx: Option<TxDescriptor>,
    /// Absolute peer indices participating at this step's distance, used to
    /// wire up collective transports (§3).
    pub level_members: Vec<usize>,
    inter_host: bool,
}

impl Step {
    fn step_idx(&self) -> Option<StepIdx> {
        self.rx
            .as_ref()
            .map(|r| r.step_idx)
            .or_else(|| self.tx.as_ref().map(|t| t.step_idx))
    }
}

/// Accumulates [`Step`]s while enforcing (I4)/(I5)/(I6): step indices are
/// non-decreasing, a step never mixes intra/inter-host traffic, and a new
/// step is opened whenever the previous one already carries a TX (an RX
/// cannot be appended after that) or the host-boundary class differs.
struct Builder {
    steps: Vec<Step>,
    next_idx: u16,
}

impl Builder {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            next_idx: 1,
        }
    }

    fn alloc_idx(&mut self) -> Result<StepIdx> {
        if self.next_idx > u8::MAX as u16 {
            return Err(Error::ExceedsLimit);
        }
        let idx = StepIdx::new(self.next_idx as u8);
        self.next_idx += 1;
        Ok(idx)
    }

    fn push_rx(
        &mut self,
        level: usize,
        inter_host: bool,
        level_members: &[usize],
        peers: Vec<usize>,
        from_every_peer: bool,
        is_leader: bool,
        expected_msg_size: usize,
    ) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let needs_new = match self.steps.last() {
            None => true,
            Some(last) => last.tx.is_some() || last.inter_host != inter_host,
        };
        if needs_new {
            let idx = self.alloc_idx()?;
            self.steps.push(Step {
                rx: Some(RxDescriptor {
                    step_idx: idx,
                    level,
                    peers,
                    from_every_peer,
                    is_leader,
                    expected_msg_size,
                }),
                tx: None,
                level_members: level_members.to_vec(),
                inter_host,
            });
        } else {
            let last = self.steps.last_mut().unwrap();
            debug_assert!(last.rx.is_none(), "cannot append a second RX to a step");
            let idx = last.step_idx().unwrap();
            last.rx = Some(RxDescriptor {
                step_idx: idx,
                level,
                peers,
                from_every_peer,
                is_leader,
                expected_msg_size,
            });
        }
        Ok(())
    }

    fn push_tx(
        &mut self,
        level: usize,
        inter_host: bool,
        level_members: &[usize],
        peers: Vec<usize>,
        is_leader: bool,
        msg_size: usize,
    ) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let append = matches!(self.steps.last(), Some(last)
            if last.tx.is_none() && last.inter_host == inter_host);
        if append {
            let last = self.steps.last_mut().unwrap();
            let idx = last.step_idx().unwrap();
            last.tx = Some(TxDescriptor {
                step_idx: idx,
                level,
                peers,
                is_leader,
                msg_size,
            });
        } else {
            let idx = self.alloc_idx()?;
            self.steps.push(Step {
                rx: None,
                tx: Some(TxDescriptor {
                    step_idx: idx,
                    level,
                    peers,
                    is_leader,
                    msg_size,
                }),
                level_members: level_members.to_vec(),
                inter_host,
            });
        }
        Ok(())
    }

    fn finish(self) -> Vec<Step> {
        self.steps
    }
}

/// Build the ordered step list for one rank (§4.1).
pub fn build(params: &BuildParams, neighbors: Option<&dyn Neighbors>) -> Result<Vec<Step>> {
    validate(params)?;

    let mut b = Builder::new();
    match params.direction {
        Direction::FaninOnly => {
            for (i, level) in params.levels.iter().enumerate() {
                build_level(&mut b, params, i, level, Role::Fanin, neighbors)?;
            }
        }
        Direction::FanoutOnly => {
            for (i, level) in params.levels.iter().enumerate().rev() {
                build_level(&mut b, params, i, level, Role::Fanout, neighbors)?;
            }
        }
        Direction::Full => {
            for (i, level) in params.levels.iter().enumerate() {
                build_level(&mut b, params, i, level, Role::Fanin, neighbors)?;
            }
            for (i, level) in params.levels.iter().enumerate().rev() {
                build_level(&mut b, params, i, level, Role::Fanout, neighbors)?;
            }
        }
        Direction::RingSingle => {
            for (i, level) in params.levels.iter().enumerate() {
                build_level(&mut b, params, i, level, Role::RingSingle, neighbors)?;
            }
        }
    }

    let steps = apply_multiroot_collapse(b.finish(), params);
    check_monotone(&steps);
    Ok(steps)
}

fn validate(params: &BuildParams) -> Result<()> {
    if params.me >= params.group_size {
        return Err(Error::InvalidParam(format!(
            "me={} outside group of size {}",
            params.me, params.group_size
        )));
    }
    for level in &params.levels {
        if level.count == 0 {
            return Err(Error::InvalidParam("level count must be nonzero".into()));
        }
        if level.count > 1 && level.stride == 0 {
            return Err(Error::InvalidParam("level stride must be nonzero".into()));
        }
        match level.pattern {
            PatternKind::KaryTree | PatternKind::KnomialTree => {
                if level.radix_or_factor < 2 {
                    return Err(Error::InvalidParam("tree radix must be >= 2".into()));
                }
            }
            PatternKind::RecursiveK | PatternKind::Bruck => {
                if level.radix_or_factor < 2 {
                    return Err(Error::InvalidParam(
                        "recursive factor must be >= 2".into(),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

enum Role {
    Fanin,
    Fanout,
    RingSingle,
}

fn level_members(level: &LevelPlacement) -> Vec<usize> {
    (0..level.count)
        .map(|k| level.first + k * level.stride)
        .collect()
}

/// This level's local rank of `me`, i.e. `(me - first) / stride`.
fn local_rank(level: &LevelPlacement, me: usize) -> usize {
    (me - level.first) / level.stride.max(1)
}

fn build_level(
    b: &mut Builder,
    params: &BuildParams,
    level_no: usize,
    level: &LevelPlacement,
    role: Role,
    neighbors: Option<&dyn Neighbors>,
) -> Result<()> {
    let members = level_members(level);
    if !members.contains(&params.me) || level.count <= 1 {
        return Ok(());
    }
    let my_rank = local_rank(level, params.me);

    match level.pattern {
        PatternKind::KaryTree | PatternKind::KnomialTree => {
            build_tree_level(b, params, level_no, level, &members, my_rank, role)
        }
        PatternKind::Ring | PatternKind::RingSingle => {
            build_ring_level(b, level_no, level, &members, my_rank, role)
        }
        PatternKind::RecursiveK | PatternKind::Bruck => {
            build_recursive_level(b, level_no, level, &members, my_rank)
        }
        PatternKind::Pairwise => build_pairwise_level(b, level_no, level, &members, my_rank),
        PatternKind::Neighbor => {
            let n = neighbors.ok_or_else(|| {
                Error::InvalidParam("Neighbor pattern requires a Neighbors collaborator".into())
            })?;
            build_neighbor_level(b, level_no, level, &members, n)
        }
    }
}

/// K-ary / K-nomial tree: compute parent/children relative to the local
/// rank within the level under the configured radix, rotated by `root` when
/// one is given.
fn build_tree_level(
    b: &mut Builder,
    params: &BuildParams,
    level_no: usize,
    level: &LevelPlacement,
    members: &[usize],
    my_rank: usize,
    role: Role,
) -> Result<()> {
    let radix = level.radix_or_factor;
    let n = level.count;
    let rotation = params
        .root
        .map(|r| r.saturating_sub(level.first) % n)
        .unwrap_or(0);
    let rank = (my_rank + n - rotation % n) % n;

    let parent_rank = if rank == 0 { None } else { Some((rank - 1) / radix) };
    let first_child = rank * radix + 1;
    let children_ranks: Vec<usize> = (first_child..(first_child + radix).min(n)).collect();
    let rank_to_member = |r: usize| -> usize { members[(r + rotation) % n] };

    match role {
        Role::Fanin => {
            let from: Vec<usize> = children_ranks.iter().map(|&r| rank_to_member(r)).collect();
            b.push_rx(
                level_no,
                level.inter_host,
                members,
                from,
                true,
                rank == 0,
                level.rx_msg_size,
            )?;
            if let Some(p) = parent_rank {
                b.push_tx(
                    level_no,
                    level.inter_host,
                    members,
                    vec![rank_to_member(p)],
                    false,
                    level.tx_msg_size,
                )?;
            }
        }
        Role::Fanout => {
            if let Some(p) = parent_rank {
                b.push_rx(
                    level_no,
                    level.inter_host,
                    members,
                    vec![rank_to_member(p)],
                    false,
                    false,
                    level.rx_msg_size,
                )?;
            }
            let to: Vec<usize> = children_ranks.iter().map(|&r| rank_to_member(r)).collect();
            b.push_tx(
                level_no,
                level.inter_host,
                members,
                to,
                rank == 0,
                level.tx_msg_size,
            )?;
        }
        Role::RingSingle => unreachable!("tree levels never use the RingSingle role"),
    }
    Ok(())
}

/// Ring: RX-from-left then TX-to-right. `Full` runs this twice in a row
/// (reduce-scatter then allgather half); `RingSingle` runs it once,
/// starting from the root.
fn build_ring_level(
    b: &mut Builder,
    level_no: usize,
    level: &LevelPlacement,
    members: &[usize],
    my_rank: usize,
    role: Role,
) -> Result<()> {
    let n = members.len();
    let left = members[(my_rank + n - 1) % n];
    let right = members[(my_rank + 1) % n];
    let rounds = match role {
        Role::RingSingle => 1,
        _ => 2,
    };
    for _ in 0..rounds {
        b.push_rx(
            level_no,
            level.inter_host,
            members,
            vec![left],
            false,
            false,
            level.rx_msg_size,
        )?;
        b.push_tx(
            level_no,
            level.inter_host,
            members,
            vec![right],
            false,
            level.tx_msg_size,
        )?;
    }
    Ok(())
}

/// Recursive-k-ing / Bruck (§4.1): every member exchanges with
/// `factor - 1` logical peers at stride `span`, doubling (more generally,
/// multiplying by `factor`) `span` each round until it covers the whole
/// (padded) level. Bruck differs by shifting the destination offsets down
/// by one, excluding the `step == 0` (self) offset recursive-k keeps
/// implicit.
fn build_recursive_level(
    b: &mut Builder,
    level_no: usize,
    level: &LevelPlacement,
    members: &[usize],
    my_rank: usize,
) -> Result<()> {
    let n = level.count;
    let factor = level.radix_or_factor;
    let is_bruck = matches!(level.pattern, PatternKind::Bruck);

    let mut span: usize = 1;
    while span < n {
        let mut peers = Vec::with_capacity(factor.saturating_sub(1));
        for step in 1..factor {
            let offset = if is_bruck { step - 1 } else { step };
            let partner = (my_rank + offset * span) % n;
            if partner != my_rank {
                peers.push(members[partner]);
            }
        }
        peers.sort_unstable();
        peers.dedup();
        if !peers.is_empty() {
            b.push_tx(
                level_no,
                level.inter_host,
                members,
                peers.clone(),
                false,
                level.tx_msg_size,
            )?;
            b.push_rx(
                level_no,
                level.inter_host,
                members,
                peers,
                false,
                false,
                level.rx_msg_size,
            )?;
        }
        span = span.saturating_mul(factor);
    }
    Ok(())
}

/// Pairwise: TX to every other level member, then RX from each (§4.1).
fn build_pairwise_level(
    b: &mut Builder,
    level_no: usize,
    level: &LevelPlacement,
    members: &[usize],
    my_rank: usize,
) -> Result<()> {
    let others: Vec<usize> = members
        .iter()
        .copied()
        .enumerate()
        .filter(|(r, _)| *r != my_rank)
        .map(|(_, m)| m)
        .collect();
    b.push_tx(
        level_no,
        level.inter_host,
        members,
        others.clone(),
        false,
        level.tx_msg_size,
    )?;
    b.push_rx(
        level_no,
        level.inter_host,
        members,
        others,
        true,
        false,
        level.rx_msg_size,
    )
}

fn build_neighbor_level(
    b: &mut Builder,
    level_no: usize,
    level: &LevelPlacement,
    members: &[usize],
    neighbors: &dyn Neighbors,
) -> Result<()> {
    let (in_deg, out_deg) = neighbors.degrees();
    let (in_list, out_list) = neighbors.peers();
    debug_assert_eq!(in_list.len(), in_deg);
    debug_assert_eq!(out_list.len(), out_deg);
    b.push_tx(
        level_no,
        level.inter_host,
        members,
        out_list,
        false,
        level.tx_msg_size,
    )?;
    b.push_rx(
        level_no,
        level.inter_host,
        members,
        in_list,
        false,
        false,
        level.rx_msg_size,
    )
}

/// (§4.1 "Multi-root step"): if a fan-in reached a group of size
/// `<= multiroot_thresh`, the subsequent fan-out over that same group can be
/// replaced with a simultaneous all-to-all square, so every participant
/// observes the reduced value at once instead of waiting on tree depth.
/// The plan lowerer is what actually binds the extra endpoints; here we
/// only relabel the matching fan-out step's peer sets.
fn apply_multiroot_collapse(steps: Vec<Step>, params: &BuildParams) -> Vec<Step> {
    if params.direction != Direction::Full || params.multiroot_thresh == 0 {
        return steps;
    }
    let Some(top_members) = steps
        .iter()
        .filter(|s| s.rx.as_ref().is_some_and(|r| r.is_leader))
        .last()
        .filter(|s| s.level_members.len() <= params.multiroot_thresh)
        .map(|s| s.level_members.clone())
    else {
        return steps;
    };

    steps
        .into_iter()
        .map(|mut s| {
            if s.level_members == top_members && s.tx.as_ref().is_some_and(|t| t.is_leader) {
                if let Some(tx) = s.tx.as_mut() {
                    tx.peers = top_members.clone();
                    tx.peers.retain(|m| Some(*m) != Some(top_members[0]) || top_members.len() == 1);
                }
                if let Some(rx) = s.rx.as_mut() {
                    rx.peers = top_members.clone();
                    rx.from_every_peer = true;
                }
            }
            s
        })
        .collect()
}

fn check_monotone(steps: &[Step]) {
    let mut last = 0u8;
    for s in steps {
        if let Some(idx) = s.step_idx() {
            debug_assert!(
                idx.get() >= last,
                "step indices must be non-decreasing (I4)"
            );
            last = idx.get();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kary_params(me: usize, n: usize, radix: usize, direction: Direction) -> BuildParams {
        BuildParams {
            me,
            group_size: n,
            root: Some(0),
            levels: vec![LevelPlacement {
                first: 0,
                stride: 1,
                count: n,
                pattern: PatternKind::KaryTree,
                radix_or_factor: radix,
                tx_msg_size: 8,
                rx_msg_size: 8,
                inter_host: false,
            }],
            direction,
            multiroot_thresh: 0,
        }
    }

    /// S1: barrier on N=4, one host, k-ary radix 2: root (rank 0) must
    /// receive from both its children then send back down.
    fn steps_for(me: usize) -> Vec<Step> {
        build(&kary_params(me, 4, 2, Direction::Full), None).unwrap()
    }

    #[test]
    fn s1_root_receives_from_every_leaf_then_sends_back() {
        let steps = steps_for(0);
        let total_rx: usize = steps.iter().filter_map(|s| s.rx.as_ref()).map(|r| r.peers.len()).sum();
        let total_tx: usize = steps.iter().filter_map(|s| s.tx.as_ref()).map(|t| t.peers.len()).sum();
        assert_eq!(total_rx, 3, "root must hear from all 3 other ranks");
        assert_eq!(total_tx, 3, "root must answer all 3 other ranks");
    }

    #[test]
    fn s1_leaf_sends_to_parent_then_waits_for_reply() {
        let steps = steps_for(3);
        assert!(steps.iter().any(|s| s.tx.as_ref().is_some_and(|t| t.peers.contains(&0))));
        assert!(steps.iter().any(|s| s.rx.as_ref().is_some_and(|r| r.peers.contains(&0))));
    }

    #[test]
    fn step_indices_are_non_decreasing() {
        for me in 0..4 {
            let steps = steps_for(me);
            check_monotone(&steps);
        }
    }

    #[test]
    fn recursive_doubling_three_rounds_for_n8() {
        let params = BuildParams {
            me: 0,
            group_size: 8,
            root: None,
            levels: vec![LevelPlacement {
                first: 0,
                stride: 1,
                count: 8,
                pattern: PatternKind::RecursiveK,
                radix_or_factor: 2,
                tx_msg_size: 4,
                rx_msg_size: 4,
                inter_host: false,
            }],
            direction: Direction::FaninOnly,
            multiroot_thresh: 0,
        };
        let steps = build(&params, None).unwrap();
        let rounds = steps.iter().filter(|s| s.tx.is_some()).count();
        assert_eq!(rounds, 3, "log2(8) = 3 rounds of recursive doubling");
    }

    #[test]
    fn ring_full_emits_two_rounds_per_member() {
        let params = BuildParams {
            me: 0,
            group_size: 4,
            root: None,
            levels: vec![LevelPlacement {
                first: 0,
                stride: 1,
                count: 4,
                pattern: PatternKind::Ring,
                radix_or_factor: 2,
                tx_msg_size: 4,
                rx_msg_size: 4,
                inter_host: false,
            }],
            direction: Direction::FaninOnly,
            multiroot_thresh: 0,
        };
        let steps = build(&params, None).unwrap();
        assert_eq!(steps.iter().filter(|s| s.tx.is_some()).count(), 2);
    }

    #[test]
    fn invalid_param_rejects_zero_stride_multi_member_level() {
        let params = BuildParams {
            me: 0,
            group_size: 4,
            root: None,
            levels: vec![LevelPlacement {
                first: 0,
                stride: 0,
                count: 4,
                pattern: PatternKind::KaryTree,
                radix_or_factor: 2,
                tx_msg_size: 4,
                rx_msg_size: 4,
                inter_host: false,
            }],
            direction: Direction::Full,
            multiroot_thresh: 0,
        };
        assert!(matches!(build(&params, None), Err(Error::InvalidParam(_))));
    }
}
